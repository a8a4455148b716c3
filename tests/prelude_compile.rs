//! Compile-time prelude coverage test.
use std::time::Duration;
use tollgate::prelude::*;
use tower::service_fn;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let config = TollgateConfig::default();
    let dispatcher = Dispatcher::from_config(&config, NullSink).expect("valid config");
    let key = CacheKey::balance(1, "0xW");
    assert_eq!(key.domain(), CacheDomain::Balance);
    let policy = CachePolicy::for_domain(key, &config.cache_ttls);
    assert_eq!(policy.ttl, Duration::from_secs(30));

    let layer = DispatchLayer::new(dispatcher, move |_: &()| {
        DispatchKey::cached("balances", policy.clone())
    });
    let mut svc = layer.layer(service_fn(|_req: ()| async { Ok::<_, std::io::Error>(()) }));
    svc.call(()).await.expect("service call failed");
}
