//! The queue broker client. The broker itself (reservation, touch/heartbeat, release, delete)
//! is out of scope for this crate; we only specify the interface the task execution loop
//! consumes, following the same shape the real `beanstalkc`-backed slave used: reserve, touch,
//! release, delete.

use crate::task::{ReservedTask, Task};
use anyhow::Result;
use async_trait::async_trait;

/// A reservation token. `touch` extends the broker-side lease so the task isn't re-delivered
/// while we're still working on it.
///
/// `release` and `delete` take `&self` rather than consuming the handle, so the same handle can
/// be shared (via `Arc`) between the task in flight and the termination-signal handler: a real
/// beanstalkd connection treats a second release/delete on an already-released/deleted job as a
/// no-op, so implementations are expected to be idempotent. The exactly-once invariant is
/// enforced by discipline in the main loop rather than by the type system.
#[async_trait]
pub trait BrokerHandle: Send + Sync {
    async fn touch(&self) -> Result<()>;
    async fn release(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

/// The queue broker itself. `reserve` blocks until a task is available.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn reserve(&self) -> Result<ReservedTask>;
}

/// A minimal line-oriented client for a beanstalkd-style queue, matching the wire shape the
/// original Python slave spoke via `beanstalkc`. Jobs are JSON-encoded [`Task`] values; the
/// reservation id is the beanstalkd job id.
pub mod beanstalk {
    use super::*;
    use std::sync::{atomic::AtomicBool, Arc};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpStream,
        sync::Mutex,
    };

    /// A single beanstalkd connection, shared between the main loop (for `reserve`) and every
    /// outstanding [`BrokerHandle`] (for `touch`/`release`/`delete`). Beanstalkd's protocol is
    /// request/response over one connection, so all operations serialize behind the mutex.
    pub struct BeanstalkBroker {
        conn: Arc<Mutex<BufReader<TcpStream>>>,
        tube: String,
    }

    impl BeanstalkBroker {
        pub async fn connect(addr: &str, tube: &str) -> Result<Self> {
            let stream = TcpStream::connect(addr).await?;
            Ok(Self {
                conn: Arc::new(Mutex::new(BufReader::new(stream))),
                tube: tube.to_string(),
            })
        }

        pub fn tube(&self) -> &str {
            &self.tube
        }
    }

    #[async_trait]
    impl Broker for BeanstalkBroker {
        async fn reserve(&self) -> Result<ReservedTask> {
            let header = {
                let mut conn = self.conn.lock().await;
                conn.get_mut().write_all(b"reserve\r\n").await?;
                conn.get_mut().flush().await?;
                let mut line = String::new();
                conn.read_line(&mut line).await?;
                line.trim_end().to_string()
            };
            let mut parts = header.split_whitespace();
            let status = parts.next().unwrap_or_default();
            anyhow::ensure!(status == "RESERVED", "unexpected reserve response: {header}");
            let job_id: u64 = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing job id in reserve response"))?
                .parse()?;
            let body_len: usize = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing body length in reserve response"))?
                .parse()?;
            let mut body = vec![0u8; body_len + 2];
            {
                let mut conn = self.conn.lock().await;
                tokio::io::AsyncReadExt::read_exact(conn.get_mut(), &mut body).await?;
            }
            body.truncate(body_len);
            let task: Task = serde_json::from_slice(&body)?;
            Ok(ReservedTask {
                task,
                handle: Arc::new(BeanstalkHandle {
                    conn: self.conn.clone(),
                    job_id,
                    done: AtomicBool::new(false),
                }),
            })
        }
    }

    struct BeanstalkHandle {
        conn: Arc<Mutex<BufReader<TcpStream>>>,
        job_id: u64,
        // Guards against sending a second release/delete after the first, since beanstalkd
        // itself would reject (rather than silently ignore) an operation on a job id it no
        // longer considers reserved by us.
        done: AtomicBool,
    }

    impl BeanstalkHandle {
        async fn send(&self, line: String) -> Result<()> {
            let mut conn = self.conn.lock().await;
            conn.get_mut().write_all(line.as_bytes()).await?;
            conn.get_mut().flush().await?;
            let mut resp = String::new();
            conn.read_line(&mut resp).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerHandle for BeanstalkHandle {
        async fn touch(&self) -> Result<()> {
            self.send(format!("touch {}\r\n", self.job_id)).await
        }

        async fn release(&self) -> Result<()> {
            use std::sync::atomic::Ordering;
            if self.done.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.send(format!("release {} 0 0\r\n", self.job_id)).await
        }

        async fn delete(&self) -> Result<()> {
            use std::sync::atomic::Ordering;
            if self.done.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.send(format!("delete {}\r\n", self.job_id)).await
        }
    }
}
