use dispatch_realtime::prelude::*;
use dispatch_realtime::telemetry::{self, TelemetryConfig};
use dispatch_realtime::HttpPublicationEnabler;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(TelemetryConfig::new("mission-feed").with_default_filter("dispatch_realtime=info"))?;

    let base = std::env::var("REALTIME_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:54321".to_string());
    let api_key = std::env::var("REALTIME_API_KEY")?;
    let interpreter = std::env::var("INTERPRETER_ID").ok();

    let socket = format!(
        "{}/realtime/v1/websocket",
        base.trim_end_matches('/').replacen("http", "ws", 1)
    );
    let backend = PhoenixBackend::connect(PhoenixConfig::new(&socket, &api_key))?;
    let service = RealtimeService::builder(backend)
        .publication_enabler(HttpPublicationEnabler::new(&base, &api_key)?)
        .build()?;
    let teardown = service.init();

    println!("Connected to {}, watching missions...\n", socket);

    let (lifecycle_tx, lifecycle_rx) = broadcast::channel(8);
    let mut config = MissionUpdatesConfig::default();
    if let Some(id) = interpreter.as_deref() {
        println!("Watching interpreter {}\n", id);
        config = config.for_interpreter(id);
    }

    let updates = MissionUpdates::mount(&service, config, lifecycle_rx, |update| match update {
        MissionUpdate::Mission(e) => {
            println!("mission {} {}", e.kind.as_str(), e.row_id().unwrap_or_default())
        }
        MissionUpdate::Reservation(e) => {
            println!("reservation {} {}", e.kind.as_str(), e.row_id().unwrap_or_default())
        }
        MissionUpdate::ProfileStatus(e) => {
            println!("profile {} is now {}", e.row_id().unwrap_or_default(), e.record["status"])
        }
        MissionUpdate::Resumed(signal) => println!("resumed after {:?}, refetching", signal),
    })
    .await?;

    let _status = match interpreter.as_deref() {
        Some(id) => Some(service.subscribe_to_interpreter_status(id).await?),
        None => None,
    };

    let mut events = service.events().stream();
    loop {
        tokio::select! {
            Some(event) = events.next() => {
                match event {
                    Ok(RealtimeEvent::ConnectionStatusChanged { connected }) => {
                        println!("connection {}", if connected { "up" } else { "down" });
                        let signal = if connected { LifecycleSignal::Online } else { LifecycleSignal::Offline };
                        let _ = lifecycle_tx.send(signal);
                    }
                    Ok(RealtimeEvent::InterpreterStatusChanged { interpreter_id, status }) => {
                        println!("interpreter {} -> {}", interpreter_id, status);
                    }
                    Ok(RealtimeEvent::SubscriptionExhausted { key, attempts }) => {
                        println!("{} gave up after {} attempts, reconnecting", key, attempts);
                        service.force_reconnect(&key).await?;
                    }
                    Err(e) => println!("event stream lagged: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    updates.unmount();
    teardown.close().await;
    Ok(())
}
