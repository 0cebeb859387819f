//! Event consumption across APIs that share a transport and APIs that have
//! their own: one listener per distinct transport pool, full fan-out to the
//! destination queue, stream-order forwarding and acknowledgement.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;

use rusty_bus::transport::{MemoryBroker, TransportOptions};
use rusty_bus::{Api, BusClient, BusError, Config, Kwargs};

/// APIs `a` and `b` share one event broker; `c` has its own.
fn fanout_config(shared: &str, private: &str) -> Config {
    Config::from_json(&format!(
        r#"{{
            "apis": {{
                "default": {{
                    "rpc_transport": {{"memory": {{"broker": "{shared}"}}}},
                    "result_transport": {{"memory": {{"broker": "{shared}"}}}},
                    "event_transport": {{"memory": {{"broker": "{shared}"}}}}
                }},
                "company.a": {{"event_transport": {{"memory": {{"broker": "{shared}"}}}}}},
                "company.b": {{"event_transport": {{"memory": {{"broker": "{shared}"}}}}}},
                "company.c": {{"event_transport": {{"memory": {{"broker": "{private}"}}}}}}
            }}
        }}"#
    ))
    .expect("config must parse")
}

fn event_api(name: &str, event: &str) -> Api {
    Api::builder(name)
        .event(event, &["n"])
        .build()
        .expect("API must build")
}

fn n_kwargs(n: u64) -> Kwargs {
    let mut kwargs = Kwargs::new();
    kwargs.insert("n".to_string(), json!(n));
    kwargs
}

#[tokio::test(flavor = "multi_thread")]
async fn events_fan_out_with_one_listener_per_shared_transport() -> Result<()> {
    let client = BusClient::new(fanout_config("fanout-shared", "fanout-private"))?;
    client.register_api(event_api("company.a", "x")).await?;
    client.register_api(event_api("company.b", "y")).await?;
    client.register_api(event_api("company.c", "z")).await?;

    let (destination, mut received) = mpsc::channel(64);
    client
        .consume_events(
            vec![
                ("company.a".to_string(), "x".to_string()),
                ("company.b".to_string(), "y".to_string()),
                ("company.c".to_string(), "z".to_string()),
            ],
            "fanout-listener",
            destination,
            TransportOptions::new(),
        )
        .await?;

    // Let the listener tasks attach before publishing.
    sleep(Duration::from_millis(50)).await;

    // Two distinct pools, so exactly two listener tasks: one subscriber on
    // the shared broker (serving a and b), one on the private broker.
    assert_eq!(MemoryBroker::named("fanout-shared").live_event_subscriber_count(), 1);
    assert_eq!(MemoryBroker::named("fanout-private").live_event_subscriber_count(), 1);

    client
        .send_event("company.a", "x", n_kwargs(1), TransportOptions::new())
        .await?;
    client
        .send_event("company.b", "y", n_kwargs(2), TransportOptions::new())
        .await?;
    client
        .send_event("company.c", "z", n_kwargs(3), TransportOptions::new())
        .await?;

    let mut names = Vec::new();
    for _ in 0..3 {
        let event = received.recv().await.expect("event must arrive");
        names.push(event.canonical_name());
    }
    names.sort();
    assert_eq!(names, vec!["company.a.x", "company.b.y", "company.c.z"]);

    // Every delivered batch is acknowledged once it has been forwarded.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(MemoryBroker::named("fanout-shared").unacknowledged_count(), 0);
    assert_eq!(MemoryBroker::named("fanout-private").unacknowledged_count(), 0);

    client.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn events_arrive_in_stream_order_within_one_transport() -> Result<()> {
    let client = BusClient::new(fanout_config("order-shared", "order-private"))?;
    client.register_api(event_api("company.a", "x")).await?;

    let (destination, mut received) = mpsc::channel(64);
    client
        .consume_events(
            vec![("company.a".to_string(), "x".to_string())],
            "order-listener",
            destination,
            TransportOptions::new(),
        )
        .await?;
    sleep(Duration::from_millis(50)).await;

    for n in 0..10 {
        client
            .send_event("company.a", "x", n_kwargs(n), TransportOptions::new())
            .await?;
    }

    for n in 0..10u64 {
        let event = received.recv().await.expect("event must arrive");
        assert_eq!(event.kwargs["n"], json!(n));
    }

    client.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sending_undeclared_events_or_arguments_is_refused() -> Result<()> {
    let client = BusClient::new(fanout_config("refuse-shared", "refuse-private"))?;
    client.register_api(event_api("company.a", "x")).await?;

    assert!(matches!(
        client
            .send_event("company.a", "unheard_of", n_kwargs(1), TransportOptions::new())
            .await,
        Err(BusError::UnknownEvent { .. })
    ));
    assert!(matches!(
        client
            .send_event("company.unregistered", "x", n_kwargs(1), TransportOptions::new())
            .await,
        Err(BusError::UnknownApi(_))
    ));

    let mut wrong = Kwargs::new();
    wrong.insert("surprise".to_string(), json!(1));
    assert!(matches!(
        client
            .send_event("company.a", "x", wrong, TransportOptions::new())
            .await,
        Err(BusError::InvalidEventArguments { .. })
    ));

    assert!(matches!(
        client
            .consume_events(
                Vec::new(),
                "empty-listener",
                mpsc::channel(1).0,
                TransportOptions::new()
            )
            .await,
        Err(BusError::NothingToListenFor)
    ));

    client.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn history_replays_past_events_newest_first() -> Result<()> {
    let client = BusClient::new(fanout_config("history-shared", "history-private"))?;
    client.register_api(event_api("company.a", "x")).await?;

    for n in 0..3 {
        client
            .send_event("company.a", "x", n_kwargs(n), TransportOptions::new())
            .await?;
    }
    // Publication is pipelined; give the dock a moment to flush.
    sleep(Duration::from_millis(50)).await;

    let events = client.event_history("company.a", "x", None, None).await?;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].kwargs["n"], json!(2));
    assert_eq!(events[2].kwargs["n"], json!(0));

    client.close().await?;
    Ok(())
}
