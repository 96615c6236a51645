//! Request Dispatch
//!
//! Turns inbound request envelopes into result or error envelopes. Shell
//! commands go through one queue per connection so they reach the
//! interpreter in arrival order; everything else runs on its own task.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use outpost_protocol::payloads::{ErrorPayload, PongPayload, ServiceListResult, ServiceStatusResult};
use outpost_protocol::{Envelope, MessageType, Payload};

use super::error::HandlerError;
use super::files::FileHandler;
use super::logs::LogHandler;
use super::services::{ServiceManager, SystemdManager};
use crate::cli::config::Config;
use crate::shell::{CommandExecutor, ShellSession};

type Failure = (&'static str, String);

fn handler_failure(e: HandlerError) -> Failure {
    (e.code(), e.to_string())
}

/// The agent's request handlers.
pub struct RequestHandler {
    shell: Arc<dyn CommandExecutor>,
    files: FileHandler,
    services: Arc<dyn ServiceManager>,
    logs: LogHandler,
}

impl RequestHandler {
    pub fn new(
        shell: Arc<dyn CommandExecutor>,
        files: FileHandler,
        services: Arc<dyn ServiceManager>,
        logs: LogHandler,
    ) -> Self {
        Self {
            shell,
            files,
            services,
            logs,
        }
    }

    /// Handlers backed by a real shell session and systemd.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ShellSession::new(config.shell.clone())),
            FileHandler::new(config.files.root.clone()).with_idle_timeout(Duration::from_secs(
                config.files.upload_idle_timeout_secs.max(1),
            )),
            Arc::new(SystemdManager::new()),
            LogHandler::new(config.logs.directories.clone(), config.logs.max_lines),
        )
    }

    pub fn shell(&self) -> &Arc<dyn CommandExecutor> {
        &self.shell
    }

    #[cfg(test)]
    pub(crate) fn files(&self) -> &FileHandler {
        &self.files
    }

    /// Drop per-connection state left over from an earlier session.
    pub async fn begin_session(&self) {
        self.files.discard_uploads().await;
    }

    /// Handle one request. Returns `None` for envelopes that are not requests.
    pub async fn handle(&self, request: &Envelope) -> Option<Envelope> {
        let Some((_, error_kind)) = request.kind.response_types() else {
            debug!(message_type = %request.kind, "Not a request, ignoring");
            return None;
        };

        let outcome = match request.payload() {
            Ok(payload) => self.run(payload).await,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Undecodable request");
                Err(("INVALID_REQUEST", e.to_string()))
            }
        };

        let reply = match outcome {
            Ok(payload) => request.reply(payload),
            Err((code, message)) => {
                debug!(request_id = %request.id, code, %message, "Request failed");
                let error = ErrorPayload::new(code, message);
                // Every error type carries an ErrorPayload.
                let payload = match error_kind {
                    MessageType::CommandError => Payload::CommandError(error),
                    MessageType::FileError => Payload::FileError(error),
                    MessageType::ServiceError => Payload::ServiceError(error),
                    MessageType::LogError => Payload::LogError(error),
                    MessageType::AuthError => Payload::AuthError(error),
                    _ => Payload::Error(error),
                };
                request.reply(payload)
            }
        };

        match reply {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Failed to encode reply");
                None
            }
        }
    }

    async fn run(&self, payload: Payload) -> Result<Payload, Failure> {
        match payload {
            Payload::CommandExecute(req) => {
                info!(command = %req.command, "Executing command");
                self.shell
                    .execute(req)
                    .await
                    .map(Payload::CommandResult)
                    .map_err(|e| (e.code(), e.to_string()))
            }
            Payload::FileChunk(chunk) => self
                .files
                .write_chunk(chunk)
                .await
                .map(Payload::FileChunkResult)
                .map_err(handler_failure),
            Payload::FileList(req) => self
                .files
                .list(req)
                .await
                .map(Payload::FileListResult)
                .map_err(handler_failure),
            Payload::FileDelete(req) => self
                .files
                .delete(req)
                .await
                .map(Payload::FileDeleteResult)
                .map_err(handler_failure),
            Payload::FileMkdir(req) => self
                .files
                .mkdir(req)
                .await
                .map(Payload::FileMkdirResult)
                .map_err(handler_failure),
            Payload::ServiceList(_) => self
                .services
                .list()
                .await
                .map(|services| Payload::ServiceListResult(ServiceListResult { services }))
                .map_err(handler_failure),
            Payload::ServiceStatus(req) => self
                .services
                .status(&req.name)
                .await
                .map(|service| Payload::ServiceStatusResult(ServiceStatusResult { service }))
                .map_err(handler_failure),
            Payload::ServiceAction(req) => self
                .services
                .action(&req.name, req.action)
                .await
                .map(Payload::ServiceActionResult)
                .map_err(handler_failure),
            Payload::LogList(req) => self
                .logs
                .list(req)
                .await
                .map(Payload::LogListResult)
                .map_err(handler_failure),
            Payload::LogContent(req) => self
                .logs
                .content(req)
                .await
                .map(Payload::LogContentResult)
                .map_err(handler_failure),
            Payload::Ping(_) => Ok(Payload::Pong(PongPayload {
                server_time: Some(Utc::now()),
            })),
            other => Err((
                "UNSUPPORTED",
                format!("`{}` is not handled by the agent", other.kind()),
            )),
        }
    }
}

/// Per-connection dispatch onto the handlers.
pub struct Dispatcher {
    handler: Arc<RequestHandler>,
    outgoing: mpsc::Sender<Envelope>,
    commands: mpsc::UnboundedSender<Envelope>,
}

impl Dispatcher {
    /// Replies are queued on `outgoing` for the connection's writer.
    pub fn new(handler: Arc<RequestHandler>, outgoing: mpsc::Sender<Envelope>) -> Self {
        let (commands, mut queue) = mpsc::unbounded_channel::<Envelope>();

        let worker_handler = handler.clone();
        let worker_outgoing = outgoing.clone();
        tokio::spawn(async move {
            while let Some(request) = queue.recv().await {
                if worker_outgoing.is_closed() {
                    debug!(request_id = %request.id, "Connection gone, skipping queued command");
                    continue;
                }
                if let Some(reply) = worker_handler.handle(&request).await {
                    send_reply(&worker_outgoing, reply).await;
                }
            }
        });

        Self {
            handler,
            outgoing,
            commands,
        }
    }

    /// Start handling `request` without waiting for it.
    pub fn dispatch(&self, request: Envelope) {
        if request.kind == MessageType::CommandExecute {
            if self.commands.send(request).is_err() {
                warn!("Command queue closed");
            }
            return;
        }

        let handler = self.handler.clone();
        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            if let Some(reply) = handler.handle(&request).await {
                send_reply(&outgoing, reply).await;
            }
        });
    }
}

async fn send_reply(outgoing: &mpsc::Sender<Envelope>, reply: Envelope) {
    let id = reply.id.clone();
    if outgoing.send(reply).await.is_err() {
        warn!(request_id = %id, "Connection closed before reply could be sent");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use outpost_protocol::payloads::{
        CommandRequest, CommandResult, FileListRequest, ServiceAction, ServiceActionResult,
        ServiceInfo, ShellStatus,
    };
    use parking_lot::Mutex;
    use std::time::Duration;

    use crate::shell::ShellError;

    /// Echoes the command back; `sleep:<ms>` delays first.
    #[derive(Default)]
    pub(crate) struct FakeShell {
        pub seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for FakeShell {
        async fn execute(&self, request: CommandRequest) -> Result<CommandResult, ShellError> {
            if request.command == "rm -rf /" {
                return Err(ShellError::Blocked {
                    pattern: "rm -rf /".to_string(),
                });
            }
            if let Some(ms) = request.command.strip_prefix("sleep:") {
                let ms = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            self.seen.lock().push(request.command.clone());
            Ok(CommandResult {
                stdout: format!("{}\n", request.command),
                ..Default::default()
            })
        }

        fn status(&self) -> ShellStatus {
            ShellStatus {
                state: "ready".to_string(),
                cwd: None,
                commands_run: self.seen.lock().len() as u64,
            }
        }

        async fn shutdown(&self) {}
    }

    pub(crate) struct NoServices;

    #[async_trait]
    impl ServiceManager for NoServices {
        async fn list(&self) -> Result<Vec<ServiceInfo>, HandlerError> {
            Ok(vec![ServiceInfo {
                name: "fake.service".to_string(),
                ..Default::default()
            }])
        }

        async fn status(&self, name: &str) -> Result<ServiceInfo, HandlerError> {
            Err(HandlerError::NotFound(name.to_string()))
        }

        async fn action(
            &self,
            name: &str,
            action: ServiceAction,
        ) -> Result<ServiceActionResult, HandlerError> {
            Ok(ServiceActionResult {
                name: name.to_string(),
                action,
                success: true,
                output: String::new(),
            })
        }
    }

    pub(crate) fn fake_handler(shell: Arc<FakeShell>) -> RequestHandler {
        RequestHandler::new(
            shell,
            FileHandler::new(None),
            Arc::new(NoServices),
            LogHandler::new(Vec::new(), 100),
        )
    }

    fn request(payload: Payload) -> Envelope {
        Envelope::request(payload).unwrap()
    }

    #[tokio::test]
    async fn test_command_result_echoes_id() {
        let handler = fake_handler(Arc::new(FakeShell::default()));
        let req = request(Payload::CommandExecute(CommandRequest::new("uptime")));

        let reply = handler.handle(&req).await.unwrap();
        assert_eq!(reply.id, req.id);
        assert_eq!(reply.kind, MessageType::CommandResult);
        assert_eq!(reply.data["stdout"], "uptime\n");
    }

    #[tokio::test]
    async fn test_blocked_command_maps_to_command_error() {
        let handler = fake_handler(Arc::new(FakeShell::default()));
        let req = request(Payload::CommandExecute(CommandRequest::new("rm -rf /")));

        let reply = handler.handle(&req).await.unwrap();
        assert_eq!(reply.kind, MessageType::CommandError);
        assert_eq!(reply.data["code"], "COMMAND_BLOCKED");
    }

    #[tokio::test]
    async fn test_handler_errors_use_family_error_type() {
        let handler = fake_handler(Arc::new(FakeShell::default()));

        let list = request(Payload::FileList(FileListRequest {
            path: "relative".to_string(),
        }));
        let reply = handler.handle(&list).await.unwrap();
        assert_eq!(reply.kind, MessageType::FileError);
        assert_eq!(reply.data["code"], "INVALID_REQUEST");

        let status = request(Payload::ServiceStatus(
            outpost_protocol::payloads::ServiceStatusRequest {
                name: "ghost".to_string(),
            },
        ));
        let reply = handler.handle(&status).await.unwrap();
        assert_eq!(reply.kind, MessageType::ServiceError);
        assert_eq!(reply.data["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_undecodable_request_gets_invalid_request() {
        let handler = fake_handler(Arc::new(FakeShell::default()));
        let mut req = request(Payload::CommandExecute(CommandRequest::new("ls")));
        req.data = serde_json::json!({"command": 42});

        let reply = handler.handle(&req).await.unwrap();
        assert_eq!(reply.kind, MessageType::CommandError);
        assert_eq!(reply.data["code"], "INVALID_REQUEST");
        assert_eq!(reply.id, req.id);
    }

    #[tokio::test]
    async fn test_non_request_is_ignored() {
        let handler = fake_handler(Arc::new(FakeShell::default()));
        let push = Envelope::new(Payload::Status(Default::default())).unwrap();
        assert!(handler.handle(&push).await.is_none());
    }

    #[tokio::test]
    async fn test_commands_run_in_arrival_order() {
        let shell = Arc::new(FakeShell::default());
        let handler = Arc::new(fake_handler(shell.clone()));
        let (tx, mut rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(handler, tx);

        let commands = ["sleep:60", "sleep:1", "sleep:30", "sleep:0"];
        let mut ids = Vec::new();
        for command in commands {
            let req = request(Payload::CommandExecute(CommandRequest::new(command)));
            ids.push(req.id.clone());
            dispatcher.dispatch(req);
        }

        for id in &ids {
            let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&reply.id, id);
        }
        assert_eq!(*shell.seen.lock(), commands.to_vec());
    }
}
