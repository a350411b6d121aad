//! Framed worker protocol and the parallel job executor.
//!
//! Orchestrators talk to helper processes over a byte stream: a JSON
//! greeting, then length-prefixed pack frames. The same protocol carries
//! one-shot job commands (`backup-file`, `verify-file`, ...) and
//! session-multiplexed streams (remote storage reads and writes).

use serde::{Deserialize, Serialize};

pub mod client;
pub mod frame;
pub mod pack;
pub mod parallel;
pub mod server;

pub use client::ProtocolClient;
pub use frame::{Command, CommandType, Frame, ProtocolStream};
pub use pack::Value;
pub use parallel::{CompletedJob, ParallelExecutor, ParallelJob};
pub use server::{Handler, ProtocolServer, Responder, SessionHandler};

/// Name sent in every greeting. The service field distinguishes worker
/// flavors (local worker, remote storage) running the same binary.
pub const PROTOCOL_NAME: &str = "pgvault";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
    pub service: String,
    pub version: String,
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use pgvault_api_types::{Error, ErrorKind, Result};

    use super::frame::{Command, CommandType};
    use super::pack::Value;
    use super::parallel::{ParallelExecutor, ParallelJob};
    use super::server::{Handler, ProtocolServer, SessionHandler};
    use super::ProtocolClient;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn spawn_server(
        service: &'static str,
        handlers: impl FnOnce() -> Vec<Handler<'static>> + Send + 'static,
    ) -> (ProtocolClient, std::thread::JoinHandle<Result<()>>) {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();

        let handle = std::thread::spawn(move || {
            let mut server = ProtocolServer::new(
                Box::new(server_stream),
                "test-server",
                service,
                vec![Duration::from_millis(5)],
            )?;
            server.run(&mut handlers())
        });

        let client =
            ProtocolClient::new(Box::new(client_stream), "test-client", service, TIMEOUT).unwrap();

        (client, handle)
    }

    #[test]
    fn execute_round_trip() {
        let (mut client, handle) = spawn_server("test", || {
            vec![Handler::process("echo", |param: &Value| {
                Ok(param.clone())
            })]
        });

        let param = Value::obj([("name", Value::from("base/1/2")), ("size", Value::from(8192u64))]);
        let result = client
            .execute(&Command::new("echo", param.clone()), true)
            .unwrap();
        assert_eq!(result, Some(param));

        client.noop().unwrap();
        client.exit().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn greeting_service_mismatch_fails() {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();

        let handle = std::thread::spawn(move || {
            ProtocolServer::new(Box::new(server_stream), "s", "worker", vec![]).map(|_| ())
        });

        let err =
            ProtocolClient::new(Box::new(client_stream), "c", "other-service", TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn handler_error_carries_code_and_stack() {
        let (mut client, handle) = spawn_server("test", || {
            vec![Handler::process("fail", |_: &Value| -> Result<Value> {
                Err(Error::checksum("recorded checksum does not match"))
            })]
        });

        let err = client
            .execute(&Command::new("fail", Value::Null), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checksum);
        assert!(err.stack().is_some());

        // The connection survives a reported error.
        client.noop().unwrap();
        client.exit().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let (mut client, handle) = spawn_server("test", Vec::new);

        let err = client
            .execute(&Command::new("nonsense", Value::Null), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        client.exit().unwrap();
        handle.join().unwrap().unwrap();
    }

    struct CountSession {
        total: u64,
    }

    impl SessionHandler for CountSession {
        fn process(&mut self, param: &Value, out: &mut super::Responder) -> Result<bool> {
            match param.as_opt_str()? {
                Some("done") => Ok(false),
                _ => {
                    self.total += param.get("add").as_u64()?;
                    out.data(Value::UInt(self.total))?;
                    Ok(true)
                }
            }
        }
    }

    #[test]
    fn sessions_multiplex() {
        let (mut client, handle) = spawn_server("test", || {
            vec![Handler::session("count", |param: &Value| {
                Ok(Box::new(CountSession {
                    total: param.get("start").as_u64().unwrap_or(0),
                }) as Box<dyn SessionHandler>)
            })]
        });

        let a = client
            .session_open("count", Value::obj([("start", Value::from(100u64))]))
            .unwrap();
        let b = client.session_open("count", Value::Null).unwrap();
        assert_ne!(a, b);

        let add = |client: &mut ProtocolClient, id, n: u64| {
            client
                .session_process("count", id, Value::obj([("add", Value::from(n))]))
                .unwrap()
                .unwrap()
                .as_u64()
                .unwrap()
        };

        assert_eq!(add(&mut client, a, 1), 101);
        assert_eq!(add(&mut client, b, 5), 5);
        assert_eq!(add(&mut client, a, 1), 102);

        // End session b; further commands against it must fail.
        client
            .session_process("count", b, Value::from("done"))
            .unwrap();
        let err = client
            .session_process("count", b, Value::obj([("add", Value::from(1u64))]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        client.session_close("count", a, Value::Null).unwrap();
        client.exit().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn executor_runs_jobs_on_all_workers() {
        let workers = 3;
        let jobs = 17;

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let mut clients = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..workers {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let (client_stream, server_stream) = UnixStream::pair().unwrap();

            handles.push(std::thread::spawn(move || {
                let mut server =
                    ProtocolServer::new(Box::new(server_stream), "worker", "worker", vec![])?;
                server.run(&mut [Handler::process("square", move |param: &Value| {
                    let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(running, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));

                    let n = param.as_u64()?;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::UInt(n * n))
                })])
            }));

            clients.push(
                ProtocolClient::new(Box::new(client_stream), "client", "worker", TIMEOUT).unwrap(),
            );
        }

        let mut next = 0u64;
        let executor = ParallelExecutor::new(clients, TIMEOUT, vec![], move |_| {
            if next == jobs {
                return Ok(None);
            }

            next += 1;
            Ok(Some(ParallelJob::new(
                Value::UInt(next),
                Command::new("square", Value::UInt(next)),
            )))
        });

        let mut seen = Vec::new();
        let completed = executor
            .run(|done| {
                let key = done.key.as_u64()?;
                let result = done.result?.as_u64()?;
                assert_eq!(result, key * key);
                seen.push(key);
                Ok(())
            })
            .unwrap();

        assert_eq!(completed, jobs as usize);
        seen.sort_unstable();
        assert_eq!(seen, (1..=jobs).collect::<Vec<_>>());

        // Never more in flight than there are workers.
        assert!(max_in_flight.load(Ordering::SeqCst) <= workers);

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn executor_survives_connection_loss_mid_job() {
        use super::frame::read_frame_blocking;
        use super::server::ProtocolServer;

        let (client_stream, mut server_stream) = UnixStream::pair().unwrap();

        // A worker that dies mid-transfer: greets, reads one command, then
        // drops the connection without replying.
        let handle = std::thread::spawn(move || {
            // Reuse the server only for the greeting handshake.
            drop(ProtocolServer::new(
                Box::new(server_stream.try_clone().unwrap()),
                "worker",
                "worker",
                vec![],
            ));
            let _ = read_frame_blocking(&mut server_stream);
        });

        let client =
            ProtocolClient::new(Box::new(client_stream), "client", "worker", TIMEOUT).unwrap();

        let mut sent = false;
        let executor = ParallelExecutor::new(
            vec![client],
            Duration::from_millis(500),
            vec![],
            move |_| {
                if sent {
                    return Ok(None);
                }
                sent = true;
                Ok(Some(ParallelJob::new(
                    Value::from("doomed"),
                    Command::new("job", Value::Null),
                )))
            },
        );

        let mut failures = Vec::new();
        executor
            .run(|done| {
                if let Err(err) = done.result {
                    failures.push(err.kind());
                }
                Ok(())
            })
            .unwrap();

        // The job surfaces as an error instead of hanging the executor.
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            ErrorKind::Protocol | ErrorKind::Timeout
        ));
        handle.join().unwrap();
    }

    #[test]
    fn executor_reports_job_errors() {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();

        let handle = std::thread::spawn(move || {
            let mut server =
                ProtocolServer::new(Box::new(server_stream), "worker", "worker", vec![])?;
            server.run(&mut [Handler::process("job", |param: &Value| {
                if param.get("boom").as_bool().unwrap_or(false) {
                    Err(Error::new(ErrorKind::FileMissing, "no such file"))
                } else {
                    Ok(Value::Bool(true))
                }
            })])
        });

        let client =
            ProtocolClient::new(Box::new(client_stream), "client", "worker", TIMEOUT).unwrap();

        let mut sent = 0;
        let executor = ParallelExecutor::new(vec![client], TIMEOUT, vec![], move |_| {
            sent += 1;
            match sent {
                1 => Ok(Some(ParallelJob::new(
                    Value::from("ok"),
                    Command::new("job", Value::obj([("boom", Value::Bool(false))])),
                ))),
                2 => Ok(Some(ParallelJob::new(
                    Value::from("bad"),
                    Command::new("job", Value::obj([("boom", Value::Bool(true))])),
                ))),
                _ => Ok(None),
            }
        });

        let mut errors = Vec::new();
        executor
            .run(|done| {
                if let Err(err) = done.result {
                    errors.push((done.key.as_str().unwrap().to_string(), err.kind()));
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(errors, vec![("bad".to_string(), ErrorKind::FileMissing)]);
        handle.join().unwrap().unwrap();
    }
}
