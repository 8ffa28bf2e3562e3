//! Name resolution on the thread pool.

use super::{complete, submit, AsRequest, OpData, RequestCore};
use crate::callback::Callback;
use crate::engine::{self, Outcome, ReqId, RequestKind};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use parking_lot::Mutex;
use std::net::SocketAddr;
use tracing::debug;

/// Lookup completion callback
pub type AddrInfoCb = Callback<(Managed<GetAddrInfo>, Result<Vec<SocketAddr>, Errno>)>;

/// Managed address lookup request
#[derive(Debug, Default)]
pub struct GetAddrInfo {
    core: RequestCore,
    addresses: Mutex<Vec<SocketAddr>>,
}

impl AsRequest for GetAddrInfo {
    const KIND: RequestKind = RequestKind::GetAddrInfo;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl GetAddrInfo {
    /// Allocate a lookup request
    pub fn make(heap: &Heap) -> Managed<GetAddrInfo> {
        heap.allocate_plain("getaddrinfo")
    }
}

fn addrinfo_trampoline(native: &engine::Loop, req: ReqId, status: Status) {
    let outcome = native.take_request_outcome(req);
    let Some(op) = complete::<GetAddrInfo, AddrInfoCb>(native, req) else {
        return;
    };
    let OpData {
        request, callback, ..
    } = op;
    let result = status.map(|()| match outcome {
        Some(Outcome::AddrInfo(addrs)) => addrs,
        _ => Vec::new(),
    });
    if let Ok(addrs) = &result {
        *request.addresses.lock() = addrs.clone();
    }
    if let Some(cb) = callback {
        cb.call((request, result));
    }
}

impl Managed<GetAddrInfo> {
    /// Resolve `node`, with `service` as a numeric port
    pub fn resolve(
        &self,
        lp: &Managed<EventLoop>,
        node: &str,
        service: Option<&str>,
        cb: Option<AddrInfoCb>,
    ) -> Status {
        debug!(node, service, "Resolving address");
        let (node, service) = (node.to_owned(), service.map(str::to_owned));
        submit(self, lp, cb, Vec::new(), |native, data| {
            let req = native.getaddrinfo(data, node, service, addrinfo_trampoline)?;
            self.addresses.lock().clear();
            Ok(req)
        })
    }

    /// Addresses from the last successful lookup.
    ///
    /// A rejected submission leaves them untouched.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::RunMode;
    use std::sync::Arc;

    fn setup() -> (Heap, Managed<EventLoop>) {
        let heap = Heap::instrumented();
        let lp = EventLoop::new(&heap, BridgeConfig::default().with_clock(ClockMode::Manual)).unwrap();
        (heap, lp)
    }

    #[test]
    fn test_resolve_numeric_host() {
        let (heap, lp) = setup();
        let got = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&got);
        let cb: AddrInfoCb = heap.callback(
            move |(_, result): (Managed<GetAddrInfo>, Result<Vec<SocketAddr>, Errno>)| {
                *seen.lock() = Some(result);
            },
        );
        let req = GetAddrInfo::make(&heap);
        req.resolve(&lp, "127.0.0.1", Some("8080"), Some(cb)).unwrap();
        lp.run(RunMode::Default);

        let expected: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(*got.lock(), Some(Ok(vec![expected])));
        assert_eq!(req.addresses(), vec![expected]);
        assert!(!req.is_pending());
    }

    #[test]
    fn test_unparseable_service_fails_at_submission() {
        let (heap, lp) = setup();
        let cb: AddrInfoCb = heap.callback(|_: (Managed<GetAddrInfo>, Result<Vec<SocketAddr>, Errno>)| {
            panic!("callback must not run");
        });
        let cb_id = cb.id();
        let req = GetAddrInfo::make(&heap);
        let err = req.resolve(&lp, "127.0.0.1", Some("web"), Some(cb)).unwrap_err();
        assert_eq!(err, Errno::AddrInfoNoName);
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
        assert!(req.addresses().is_empty());
    }

    #[test]
    fn test_rejected_resubmit_keeps_previous_addresses() {
        let (heap, lp) = setup();
        let req = GetAddrInfo::make(&heap);
        req.resolve(&lp, "127.0.0.1", Some("80"), None).unwrap();
        assert_eq!(req.resolve(&lp, "127.0.0.1", Some("81"), None), Err(Errno::Busy));
        lp.run(RunMode::Default);

        let first: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(req.addresses(), vec![first]);

        let err = req.resolve(&lp, "127.0.0.1", Some("web"), None).unwrap_err();
        assert_eq!(err, Errno::AddrInfoNoName);
        assert_eq!(req.addresses(), vec![first]);

        req.resolve(&lp, "127.0.0.2", Some("90"), None).unwrap();
        assert!(req.addresses().is_empty());
        lp.run(RunMode::Default);
        assert_eq!(req.addresses(), vec!["127.0.0.2:90".parse::<SocketAddr>().unwrap()]);
    }
}
