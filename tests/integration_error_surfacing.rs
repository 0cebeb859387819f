//! A failure deep inside a background listener must surface on the caller
//! blocked in the foreground, well before any timeout would fire. Exercised
//! with a custom result transport whose receive side fails shortly after
//! arming — registered as a plugin the way a real backend would be.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use rusty_bus::transport::CallOptions;
use rusty_bus::{
    BusClient, BusError, Config, HookRegistry, Kwargs, ResultMessage, RpcMessage, Transport,
    TransportError, TransportPlugins,
};

/// A result transport that accepts sends but blows up while receiving
struct BrokenReceiveTransport;

#[async_trait]
impl Transport for BrokenReceiveTransport {}

#[async_trait]
impl rusty_bus::ResultTransport for BrokenReceiveTransport {
    fn get_return_path(&self, rpc_message: &RpcMessage) -> String {
        format!("broken://results/{}", rpc_message.id)
    }

    async fn send_result(
        &mut self,
        _rpc_message: &RpcMessage,
        _result_message: &ResultMessage,
        _return_path: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn receive_result(
        &mut self,
        _rpc_message: &RpcMessage,
        _return_path: &str,
        _options: &CallOptions,
    ) -> Result<ResultMessage, TransportError> {
        // Fail after the receiver has armed and the call has gone out.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err(TransportError::Connection("injected backend failure".to_string()))
    }
}

fn config(broker: &str) -> Config {
    Config::from_json(&format!(
        r#"{{
            "apis": {{
                "default": {{
                    "rpc_transport": {{"memory": {{"broker": "{broker}"}}}},
                    "result_transport": {{"broken": null}}
                }}
            }}
        }}"#
    ))
    .expect("config must parse")
}

#[tokio::test(flavor = "multi_thread")]
async fn a_background_listener_failure_interrupts_the_caller() -> Result<()> {
    let mut plugins = TransportPlugins::new();
    plugins.register_result("broken", |_options| Ok(BrokenReceiveTransport));

    let caller = BusClient::with_plugins(
        config("error-surfacing"),
        plugins,
        HookRegistry::new(),
    )?;

    // The default rpc_timeout is far longer than the injected failure takes;
    // a caller that only noticed at the timeout would be hanging on a queue
    // nobody will ever feed.
    let started = Instant::now();
    let outcome = caller
        .call_rpc_remote(
            "company.auth",
            "ping",
            Kwargs::new(),
            CallOptions::default(),
        )
        .await;
    let waited = started.elapsed();

    match outcome {
        Err(BusError::Transport(TransportError::Connection(message))) => {
            assert!(message.contains("injected backend failure"));
        }
        other => panic!("expected the injected transport failure, got {other:?}"),
    }
    assert!(
        waited < Duration::from_secs(5),
        "the failure surfaced promptly rather than waiting out the timeout"
    );

    caller.close().await?;
    Ok(())
}
