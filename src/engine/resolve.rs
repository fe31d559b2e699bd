//! Neighbor resolution for logical callers
//!
//! `Engine::resolve` parks a oneshot sender in the neighbor cache next to
//! any packets waiting on the same address. The returned [`Resolution`]
//! completes when a reply arrives or the retries run out. Dropping it
//! before then removes only that one waiter.

use super::Engine;
use crate::dataplane::{NeighborCache, NeighborKey, Resolve, Waiter, WaiterId};
use crate::protocol::MacAddr;
use crate::topology::NamespaceId;
use crate::{Error, Result};
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::trace;

/// Pending or finished IP-to-MAC resolution
#[derive(Debug)]
pub struct Resolution {
    ip: Ipv4Addr,
    state: State,
}

#[derive(Debug)]
enum State {
    Done(Option<Result<MacAddr>>),
    Waiting {
        key: NeighborKey,
        id: WaiterId,
        rx: oneshot::Receiver<Result<MacAddr>>,
        cache: Arc<Mutex<NeighborCache>>,
    },
}

impl Resolution {
    fn done(ip: Ipv4Addr, result: Result<MacAddr>) -> Self {
        Self {
            ip,
            state: State::Done(Some(result)),
        }
    }

    /// Address being resolved
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Waiting { .. })
    }

    /// Take the result without waiting, if there is one yet
    pub fn try_result(&mut self) -> Option<Result<MacAddr>> {
        let ip = self.ip;
        match &mut self.state {
            State::Done(result) => result.take(),
            State::Waiting { rx, .. } => {
                let result = match rx.try_recv() {
                    Ok(result) => result,
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Closed) => Err(Error::Unreachable { ip }),
                };
                self.state = State::Done(None);
                Some(result)
            }
        }
    }
}

impl Future for Resolution {
    type Output = Result<MacAddr>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ip = this.ip;
        match &mut this.state {
            State::Done(result) => {
                Poll::Ready(result.take().unwrap_or(Err(Error::Unreachable { ip })))
            }
            State::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(received) => {
                    this.state = State::Done(None);
                    // A sender dropped without answering means the row was purged
                    Poll::Ready(received.unwrap_or(Err(Error::Unreachable { ip })))
                }
            },
        }
    }
}

impl Drop for Resolution {
    fn drop(&mut self) {
        if let State::Waiting { key, id, cache, .. } = &self.state {
            let removed = cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel(key, *id);
            if removed.is_some() {
                trace!("{} {}: resolution abandoned", key.iface, key.ip);
            }
        }
    }
}

impl Engine {
    /// Resolve `ip` to the MAC frames for it are sent to from `ns`
    ///
    /// Local addresses resolve to their own interface. Off-link addresses
    /// resolve to their gateway's MAC. Without a route the result is
    /// `Unreachable` right away. Otherwise a query goes out (or joins one
    /// already in flight) and the future completes on the reply, or with
    /// `Unreachable` once the clock has been advanced past the last retry.
    pub fn resolve(&self, ns: NamespaceId, ip: Ipv4Addr) -> Result<Resolution> {
        let own_mac = {
            let topo = self.topo();
            topo.namespace(ns)?;
            topo.local_owner(ns, ip)
                .and_then(|iface| topo.interface(iface).ok())
                .map(|iface| iface.mac)
        };
        if let Some(mac) = own_mac {
            return Ok(Resolution::done(ip, Ok(mac)));
        }

        let usable = self.usable_interfaces(ns);
        let hit = {
            let routing = self.routing();
            routing
                .fib(ns)
                .and_then(|fib| fib.lookup(ip, |i| usable.contains(&i)))
        };
        let Some(hit) = hit else {
            return Ok(Resolution::done(ip, Err(Error::Unreachable { ip })));
        };

        let key = NeighborKey::new(ns, hit.egress, hit.next_hop);
        let (tx, rx) = oneshot::channel();
        let now = self.clock.now();
        let outcome = self.neighbors().resolve(key, Waiter::Task(tx), now);

        match outcome {
            Resolve::Ready(mac, _) => Ok(Resolution::done(ip, Ok(mac))),
            Resolve::Pending { id, probe } => {
                let resolution = Resolution {
                    ip,
                    state: State::Waiting {
                        key,
                        id,
                        rx,
                        cache: Arc::clone(&self.neighbors),
                    },
                };
                // The reply may arrive before this returns
                if let Some(probe) = probe {
                    self.send_probe_now(probe);
                }
                Ok(resolution)
            }
        }
    }
}
