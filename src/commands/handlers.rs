//! Built-in direct-method handlers

use crate::transport::{CommandHandler, CommandRequest, CommandResponse, CommandRegistry};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const IS_ALIVE: &str = "IsAlive";
pub const START_LONG_RUNNING: &str = "StartLongRunning";

/// Default delay before `StartLongRunning` answers
pub const DEFAULT_LONG_RUNNING_DELAY: Duration = Duration::from_secs(20);

fn executed(name: &str) -> CommandResponse {
    CommandResponse {
        payload: json!({ "result": format!("Executed direct method: {name}") })
            .to_string()
            .into_bytes(),
        status: 200,
    }
}

/// Liveness probe; answers immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct IsAlive;

#[async_trait]
impl CommandHandler for IsAlive {
    async fn handle(&self, request: CommandRequest) -> CommandResponse {
        info!(method = %request.name, "Direct method invoked");
        executed(&request.name)
    }
}

/// Answers only after a fixed delay
#[derive(Debug, Clone, Copy)]
pub struct StartLongRunning {
    pub delay: Duration,
}

impl Default for StartLongRunning {
    fn default() -> Self {
        Self {
            delay: DEFAULT_LONG_RUNNING_DELAY,
        }
    }
}

#[async_trait]
impl CommandHandler for StartLongRunning {
    async fn handle(&self, request: CommandRequest) -> CommandResponse {
        info!(
            method = %request.name,
            delay_ms = self.delay.as_millis() as u64,
            "Long-running direct method started"
        );
        tokio::time::sleep(self.delay).await;
        executed(&request.name)
    }
}

/// Registry with both built-in handlers
pub fn default_registry(long_running_delay: Duration) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.insert(IS_ALIVE.to_string(), Arc::new(IsAlive) as Arc<dyn CommandHandler>);
    registry.insert(
        START_LONG_RUNNING.to_string(),
        Arc::new(StartLongRunning {
            delay: long_running_delay,
        }),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> CommandRequest {
        CommandRequest {
            name: name.to_string(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_is_alive_answers_immediately() {
        let response = IsAlive.handle(request(IS_ALIVE)).await;
        assert_eq!(response.status, 200);

        let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body["result"], "Executed direct method: IsAlive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_running_waits_for_delay() {
        let handler = StartLongRunning {
            delay: Duration::from_secs(20),
        };
        let start = tokio::time::Instant::now();
        let response = handler.handle(request(START_LONG_RUNNING)).await;

        assert!(start.elapsed() >= Duration::from_secs(20));
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_default_registry() {
        let registry = default_registry(Duration::from_millis(5));
        assert!(registry.contains_key(IS_ALIVE));
        assert!(registry.contains_key(START_LONG_RUNNING));
        assert_eq!(
            StartLongRunning::default().delay,
            DEFAULT_LONG_RUNNING_DELAY
        );
    }
}
