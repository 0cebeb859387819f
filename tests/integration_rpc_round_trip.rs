//! End-to-end RPC scenarios over the in-process memory broker: two bus
//! clients sharing a named broker, one serving an API and one calling it.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;

use rusty_bus::transport::CallOptions;
use rusty_bus::{Api, BusClient, BusError, Config, Kwargs, ParameterKind};

fn memory_config(broker: &str) -> Config {
    Config::from_json(&format!(
        r#"{{
            "apis": {{
                "default": {{
                    "rpc_transport": {{"memory": {{"broker": "{broker}"}}}},
                    "result_transport": {{"memory": {{"broker": "{broker}"}}}},
                    "event_transport": {{"memory": {{"broker": "{broker}"}}}}
                }}
            }}
        }}"#
    ))
    .expect("config must parse")
}

fn kwargs(entries: &[(&str, serde_json::Value)]) -> Kwargs {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn auth_api() -> Api {
    Api::builder("company.auth")
        .procedure("ping", &[], |_| async { Ok(json!("pong")) })
        .procedure(
            "check_password",
            &[
                ("username", ParameterKind::String),
                ("password", ParameterKind::String),
            ],
            |kwargs| async move {
                if kwargs["username"] == json!("admin") && kwargs["password"] == json!("secret") {
                    Ok(json!(true))
                } else {
                    Err(BusError::Application("nope".to_string()))
                }
            },
        )
        .procedure(
            "double",
            &[("n", ParameterKind::Integer)],
            |kwargs| async move {
                let n = kwargs["n"].as_i64().ok_or_else(|| {
                    BusError::Application("n must arrive as an integer".to_string())
                })?;
                Ok(json!(n * 2))
            },
        )
        .procedure("play_dead", &[], |_| async { Err(BusError::SuddenDeath) })
        .build()
        .expect("API must build")
}

async fn serving_client(broker: &str) -> Result<BusClient> {
    let server = BusClient::new(memory_config(broker))?;
    server.register_api(auth_api()).await?;
    server.consume_rpcs(None).await?;
    Ok(server)
}

#[tokio::test(flavor = "multi_thread")]
async fn a_remote_procedure_answers_within_the_timeout() -> Result<()> {
    let server = serving_client("rpc-happy").await?;
    let caller = BusClient::new(memory_config("rpc-happy"))?;

    let result = caller
        .call_rpc_remote("company.auth", "ping", Kwargs::new(), CallOptions::default())
        .await?;
    assert_eq!(result, json!("pong"));

    caller.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_remote_application_error_reaches_the_caller() -> Result<()> {
    let server = serving_client("rpc-error").await?;
    let caller = BusClient::new(memory_config("rpc-error"))?;

    let outcome = caller
        .call_rpc_remote(
            "company.auth",
            "check_password",
            kwargs(&[("username", json!("admin")), ("password", json!("wrong"))]),
            CallOptions::default(),
        )
        .await;

    match outcome {
        Err(BusError::ServerError {
            canonical_name,
            message,
            trace,
        }) => {
            assert_eq!(canonical_name, "company.auth.check_password");
            assert!(message.contains("nope"));
            assert!(trace.is_some(), "the remote trace travels with the error");
        }
        other => panic!("expected a server error, got {other:?}"),
    }

    caller.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn an_unserved_api_times_out() -> Result<()> {
    let caller = BusClient::new(memory_config("rpc-timeout"))?;

    let started = Instant::now();
    let outcome = caller
        .call_rpc_remote(
            "company.void",
            "nothing",
            Kwargs::new(),
            CallOptions::with_timeout(Duration::from_millis(100)),
        )
        .await;
    let waited = started.elapsed();

    match outcome {
        Err(error @ BusError::RpcTimeout { .. }) => {
            let text = error.to_string();
            assert!(text.contains("company.void.nothing"));
            assert!(text.contains("seconds"), "elapsed time is human formatted: {text}");
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(5), "timed out promptly");

    caller.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sudden_death_loses_the_result_and_the_caller_times_out() -> Result<()> {
    let server = serving_client("rpc-sudden-death").await?;
    let caller = BusClient::new(memory_config("rpc-sudden-death"))?;

    let outcome = caller
        .call_rpc_remote(
            "company.auth",
            "play_dead",
            Kwargs::new(),
            CallOptions::with_timeout(Duration::from_millis(200)),
        )
        .await;
    assert!(matches!(outcome, Err(BusError::RpcTimeout { .. })));

    caller.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn wire_strings_are_cast_to_declared_parameter_kinds() -> Result<()> {
    let server = serving_client("rpc-casting").await?;
    let caller = BusClient::new(memory_config("rpc-casting"))?;

    // "21" arrives as a string; cast_values (on by default) coerces it to the
    // declared integer kind before the procedure runs.
    let result = caller
        .call_rpc_remote(
            "company.auth",
            "double",
            kwargs(&[("n", json!("21"))]),
            CallOptions::default(),
        )
        .await?;
    assert_eq!(result, json!(42));

    caller.close().await?;
    server.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_serialise_against_a_served_api_in_submission_order() -> Result<()> {
    let server = serving_client("rpc-ordering").await?;
    let caller = BusClient::new(memory_config("rpc-ordering"))?;

    for n in 0..10i64 {
        let result = caller
            .call_rpc_remote(
                "company.auth",
                "double",
                kwargs(&[("n", json!(n))]),
                CallOptions::default(),
            )
            .await?;
        assert_eq!(result, json!(n * 2));
    }

    caller.close().await?;
    server.close().await?;
    Ok(())
}
