//! DNS resolver scenarios (spec §8, S6).

use coronet::context::ExecutionContext;
use coronet::resolver::ResolveFlags;

/// S6: resolving "127.0.0.1"/"80" with `NUMERIC_HOST | NUMERIC_SERVICE` set
/// returns exactly one IPv4 127.0.0.1:80 entry without touching DNS.
#[test]
fn numeric_host_and_service_resolve_to_a_single_loopback_entry() {
    let ctx = ExecutionContext::new().unwrap();
    ctx.clone().block_on(async {
        let resolver = ctx.resolver();
        let addrs = resolver
            .resolve(
                "127.0.0.1",
                "80",
                ResolveFlags::NUMERIC_HOST | ResolveFlags::NUMERIC_SERVICE,
            )
            .await
            .unwrap();

        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv4());
        assert_eq!(addrs[0].ip().to_string(), "127.0.0.1");
        assert_eq!(addrs[0].port(), 80);
    });
}

/// `NUMERIC_SERVICE` set with a non-numeric service string is rejected
/// without spawning a worker thread.
#[test]
fn numeric_service_rejects_a_named_service() {
    let ctx = ExecutionContext::new().unwrap();
    ctx.clone().block_on(async {
        let resolver = ctx.resolver();
        let err = resolver
            .resolve("127.0.0.1", "http", ResolveFlags::NUMERIC_SERVICE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), coronet::error::ErrorKind::InvalidArgument);
    });
}

/// `NUMERIC_HOST` set with a non-numeric host string is rejected without
/// spawning a worker thread or touching DNS.
#[test]
fn numeric_host_rejects_a_named_host() {
    let ctx = ExecutionContext::new().unwrap();
    ctx.clone().block_on(async {
        let resolver = ctx.resolver();
        let err = resolver
            .resolve("localhost", "80", ResolveFlags::NUMERIC_HOST)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), coronet::error::ErrorKind::InvalidArgument);
    });
}

/// Cancelling a resolution in flight resumes the waiter with `cancelled`
/// promptly, even though the background worker thread keeps running.
#[test]
fn cancelling_a_resolve_resumes_with_cancelled() {
    let ctx = ExecutionContext::new().unwrap();
    ctx.clone().block_on(async {
        let resolver = ctx.resolver();
        let resolve = resolver.resolve("localhost", "80", ResolveFlags::empty());
        resolve.cancel();
        let err = resolve.await.unwrap_err();
        assert_eq!(err.kind(), coronet::error::ErrorKind::Cancelled);
    });
}
