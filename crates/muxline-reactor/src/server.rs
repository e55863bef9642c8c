//! Multi-shard server
//!
//! One reactor thread per shard. Every shard binds its own listener on the
//! same address with SO_REUSEPORT and the kernel spreads incoming
//! connections across them; after that a connection lives and dies on the
//! shard that accepted it. Shard 0 binds first so a requested port 0 turns
//! into one concrete port shared by all shards.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use muxline_core::{Error, ReactorConfig, Result};

use crate::connection::{AcceptContext, Connection};
use crate::reactor::{Command, Inbox, Reactor};

/// Builds connection handlers for every shard.
pub type ConnectionFactory = Arc<dyn Fn(&AcceptContext) -> Option<Box<dyn Connection>> + Send + Sync>;

type Startup = std::result::Result<(Arc<Inbox>, Vec<SocketAddr>), String>;

struct Shard {
    inbox: Arc<Inbox>,
    thread: Option<JoinHandle<()>>,
}

pub struct Server {
    shards: Vec<Shard>,
    stop: Arc<AtomicBool>,
    next: AtomicUsize,
    local_addrs: Vec<SocketAddr>,
}

impl Server {
    /// Start `shards` reactor threads, each listening on every address in
    /// `listeners`. Returns once all shards are up, or with the first
    /// startup error after stopping the shards already running.
    pub fn start(
        config: ReactorConfig,
        shards: usize,
        listeners: &[SocketAddr],
        factory: ConnectionFactory,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        if shards == 0 {
            return Err(Error::Config("at least one shard required"));
        }

        let mut server = Server {
            shards: Vec::with_capacity(shards),
            stop: Arc::new(AtomicBool::new(false)),
            next: AtomicUsize::new(0),
            local_addrs: listeners.to_vec(),
        };

        for id in 0..shards {
            match server.spawn_shard(id, &config, Arc::clone(&factory)) {
                Ok(bound) => {
                    if id == 0 {
                        server.local_addrs = bound;
                    }
                }
                Err(e) => {
                    server.stop();
                    return Err(e);
                }
            }
        }
        tracing::info!(shards, addrs = ?server.local_addrs, "server started");
        Ok(server)
    }

    fn spawn_shard(&mut self, id: usize, config: &ReactorConfig, factory: ConnectionFactory) -> Result<Vec<SocketAddr>> {
        let (tx, rx) = mpsc::channel::<Startup>();
        let config = config.clone();
        let addrs = self.local_addrs.clone();
        let stop = Arc::clone(&self.stop);

        let thread = thread::Builder::new()
            .name(format!("muxline-shard-{}", id))
            .spawn(move || {
                let mut reactor = match Reactor::new(config, id) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                        return;
                    }
                };
                reactor.set_acceptor(move |ctx| factory(ctx));
                let mut bound = Vec::with_capacity(addrs.len());
                for addr in &addrs {
                    match reactor.add_listener(*addr) {
                        Ok(local) => bound.push(local),
                        Err(e) => {
                            let _ = tx.send(Err(format!("{}: {}", addr, e)));
                            return;
                        }
                    }
                }
                if tx.send(Ok((reactor.inbox(), bound))).is_err() {
                    return;
                }
                if let Err(e) = reactor.run(&stop) {
                    tracing::error!(shard = id, error = %e, "reactor failed");
                }
            })?;

        let startup = rx.recv().map_err(|_| Error::ShardStart {
            shard: id,
            reason: "shard thread exited during startup".into(),
        });
        match startup {
            Ok(Ok((inbox, bound))) => {
                self.shards.push(Shard {
                    inbox,
                    thread: Some(thread),
                });
                Ok(bound)
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(Error::ShardStart { shard: id, reason })
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    #[inline]
    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Addresses every shard listens on.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Run `cmd` on shard `shard`.
    pub fn submit(&self, shard: usize, cmd: Command) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        self.shards
            .get(shard)
            .ok_or(Error::NoSuchShard(shard))?
            .inbox
            .submit(cmd)
    }

    /// Run `cmd` on the next shard in turn. Returns the shard chosen.
    pub fn submit_round_robin(&self, cmd: Command) -> Result<usize> {
        if self.shards.is_empty() {
            return Err(Error::Stopped);
        }
        let shard = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.submit(shard, cmd)?;
        Ok(shard)
    }

    /// Signal every shard, wait for them to shut down. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for shard in &self.shards {
            shard.inbox.wake();
        }
        for (id, shard) in self.shards.iter_mut().enumerate() {
            if let Some(t) = shard.thread.take() {
                if t.join().is_err() {
                    tracing::error!(shard = id, "shard thread panicked");
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
