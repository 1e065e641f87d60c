//! RPC server loop run from inside the container namespaces.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use stagehand_common::error::{Result, StagehandError};

use super::methods::{Reply, RpcMethods, dispatch};
use super::{Method, Request, Response};

/// Serves one engine's method table under its service name.
pub struct RpcServer {
    service: String,
    methods: Box<dyn RpcMethods>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

fn io_error(e: std::io::Error) -> StagehandError {
    StagehandError::Io {
        path: PathBuf::from("rpc socket"),
        source: e,
    }
}

impl RpcServer {
    /// Registers `methods` under `service`.
    #[must_use]
    pub fn new(service: impl Into<String>, methods: Box<dyn RpcMethods>) -> Self {
        Self {
            service: service.into(),
            methods,
        }
    }

    /// Serves calls until the peer closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from or writing to the socket fails.
    pub fn serve(&mut self, stream: &UnixStream) -> Result<()> {
        tracing::info!(service = %self.service, "rpc server ready");
        let mut reader = BufReader::new(stream);
        let mut writer = stream;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).map_err(io_error)? == 0 {
                tracing::info!(service = %self.service, "rpc connection closed");
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle(&line);
            let mut payload = serde_json::to_string(&response)?;
            payload.push('\n');
            writer.write_all(payload.as_bytes()).map_err(io_error)?;
        }
    }

    /// Answers one request line.
    pub fn handle(&mut self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return Response {
                    transport_error: Some(format!("malformed request: {e}")),
                    ..Response::default()
                };
            }
        };
        let mut response = Response {
            id: request.id,
            ..Response::default()
        };
        let method = match self.resolve(&request.method) {
            Ok(method) => method,
            Err(message) => {
                response.transport_error = Some(message);
                return response;
            }
        };
        tracing::debug!(method = %request.method, id = request.id, "rpc call");
        match dispatch(self.methods.as_mut(), method, request.params) {
            Reply::Value(value) => response.value = value,
            Reply::Failed(message) => {
                tracing::debug!(method = %request.method, error = %message, "rpc call failed");
                response.error = Some(message);
            }
            Reply::Transport(message) => response.transport_error = Some(message),
        }
        response
    }

    fn resolve(&self, qualified: &str) -> std::result::Result<Method, String> {
        let Some((service, name)) = qualified.split_once('.') else {
            return Err(format!("method {qualified:?} is not qualified with a service"));
        };
        if service != self.service {
            return Err(format!("unknown service {service:?}"));
        }
        name.parse::<Method>()
            .map_err(|_| format!("unknown method {qualified:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::methods::PrivilegedMethods;

    fn server() -> RpcServer {
        RpcServer::new("native", Box::new(PrivilegedMethods::default()))
    }

    #[test]
    fn malformed_request_is_transport_error() {
        let resp = server().handle("{not json");
        assert!(resp.transport_error.unwrap().contains("malformed"));
        assert!(resp.error.is_none());
    }

    #[test]
    fn foreign_service_is_rejected() {
        let resp = server().handle(r#"{"id":4,"method":"other.Mkdir","params":{}}"#);
        assert_eq!(resp.id, 4);
        assert!(resp.transport_error.unwrap().contains("unknown service"));
    }

    #[test]
    fn unqualified_and_unknown_methods_are_rejected() {
        let mut srv = server();
        assert!(srv.handle(r#"{"id":1,"method":"Mkdir"}"#).transport_error.is_some());
        assert!(
            srv.handle(r#"{"id":2,"method":"native.Unmount"}"#)
                .transport_error
                .unwrap()
                .contains("unknown method")
        );
    }

    #[test]
    fn serve_returns_on_eof() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        server().serve(&ours).unwrap();
    }
}
