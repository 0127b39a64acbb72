//! Read-through behavior of `Cache::get`: single-flight fetches, blocking
//! queries, errors, refresh and expiry.

mod helpers;

use agentcache::cache::{
    Cache, CacheError, CacheType, FetchOptions, FetchResult, Options, RegisterOptions, Request,
    RequestInfo,
};
use async_trait::async_trait;
use helpers::{ClosedFlag, StubType, TestRequest, blocking, plain, refreshing};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test]
async fn zero_index_is_stored_as_one() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _opts, _req| async move {
        Ok(FetchResult::new(42u64, if n == 1 { 0 } else { 5 }))
    });
    let typ = cache.register_type("t", stub, blocking());
    let cancel = CancellationToken::new();

    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert_eq!(value, Some(42));
    assert_eq!(meta.index, 1);

    let (value, meta) = cache
        .get(
            &cancel,
            &typ,
            TestRequest::key("hello").min_index(1).timeout(ms(1000)),
        )
        .await
        .unwrap();
    assert_eq!(value, Some(42));
    assert_eq!(meta.index, 5);
    assert_eq!(calls.count(), 2);
    assert_eq!(calls.get(1).min_index, 1);
}

#[tokio::test]
async fn fetch_error_is_returned() {
    let cache = Cache::new(Options::default());
    let (stub, _calls) =
        StubType::<u64>::new(|_, _, _| async { Err(anyhow::anyhow!("backend unavailable")) });
    let typ = cache.register_type("t", stub, plain());

    let err = cache
        .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Fetch(_)));
    assert!(err.to_string().contains("backend unavailable"));
    assert_eq!(cache.stats().fetch_error, 1);
}

#[tokio::test]
async fn errors_do_not_stick() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move {
        if n == 1 {
            anyhow::bail!("first call fails");
        }
        Ok(FetchResult::new(42u64, 1))
    });
    let typ = cache.register_type("t", stub, plain());
    let cancel = CancellationToken::new();

    assert!(cache.get(&cancel, &typ, TestRequest::key("hello")).await.is_err());
    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert_eq!(value, Some(42));
    assert!(!meta.hit);
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn blank_key_bypasses_the_cache() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, 1)) });
    let typ = cache.register_type("t", stub, plain());
    let cancel = CancellationToken::new();

    for expected in 1..=2u64 {
        let (value, meta) = cache.get(&cancel, &typ, TestRequest::key("")).await.unwrap();
        assert_eq!(value, Some(expected));
        assert!(!meta.hit);
    }
    assert_eq!(calls.count(), 2);

    let stats = cache.stats();
    assert_eq!(stats.bypass, 2);
    assert_eq!(stats.entries, 0);
}

#[tokio::test]
async fn concurrent_gets_share_one_fetch() {
    let cache = Cache::new(Options::default());
    let gate = Arc::new(Semaphore::new(0));
    let (stub, calls) = {
        let gate = gate.clone();
        StubType::new(move |_, _, _| {
            let gate = gate.clone();
            async move {
                gate.acquire().await.expect("gate closed").forget();
                Ok(FetchResult::new(42u64, 1))
            }
        })
    };
    let typ = cache.register_type("t", stub, plain());

    let gets: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let typ = typ.clone();
            tokio::spawn(async move {
                cache
                    .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
                    .await
            })
        })
        .collect();

    sleep(ms(50)).await;
    assert_eq!(calls.count(), 1);
    gate.add_permits(10);

    for get in gets {
        let (value, _) = get.await.unwrap().unwrap();
        assert_eq!(value, Some(42));
    }
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn distinct_keys_fetch_independently() {
    let cache = Cache::new(Options::default());
    let gate = Arc::new(Semaphore::new(0));
    let (stub, calls) = {
        let gate = gate.clone();
        StubType::new(move |_, _, req: TestRequest| {
            let gate = gate.clone();
            async move {
                gate.acquire().await.expect("gate closed").forget();
                Ok(FetchResult::new(req.0.key.len() as u64, 1))
            }
        })
    };
    let typ = cache.register_type("t", stub, plain());

    let spawn_get = |key: &'static str| {
        let cache = cache.clone();
        let typ = typ.clone();
        tokio::spawn(async move {
            cache
                .get(&CancellationToken::new(), &typ, TestRequest::key(key))
                .await
        })
    };
    let hello = spawn_get("hello");
    let goodbye = spawn_get("goodbye");

    sleep(ms(50)).await;
    assert_eq!(calls.count(), 2);
    gate.add_permits(2);

    assert_eq!(hello.await.unwrap().unwrap().0, Some(5));
    assert_eq!(goodbye.await.unwrap().unwrap().0, Some(7));
}

#[tokio::test]
async fn blocking_get_waits_for_newer_index() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|_, opts: FetchOptions<u64>, _| async move {
        if opts.min_index == 0 {
            return Ok(FetchResult::new(1, 4));
        }
        sleep(ms(50)).await;
        Ok(FetchResult::new(2, opts.min_index + 1))
    });
    let typ = cache.register_type("t", stub, blocking());
    let cancel = CancellationToken::new();

    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert_eq!((value, meta.index), (Some(1), 4));

    let (value, meta) = cache
        .get(
            &cancel,
            &typ,
            TestRequest::key("hello").min_index(4).timeout(ms(1000)),
        )
        .await
        .unwrap();
    assert_eq!((value, meta.index), (Some(2), 5));
    assert!(!meta.hit);
    assert_eq!(calls.get(1).min_index, 4);
    assert_eq!(cache.stats().miss_block, 1);
}

#[tokio::test]
async fn blocking_get_timeout_returns_current_value() {
    let cache = Cache::new(Options::default());
    let (stub, _calls) = StubType::new(|_, opts: FetchOptions<u64>, _| async move {
        if opts.min_index == 0 {
            return Ok(FetchResult::new(1, 4));
        }
        std::future::pending().await
    });
    let typ = cache.register_type("t", stub, blocking());
    let cancel = CancellationToken::new();

    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let (value, meta) = cache
        .get(
            &cancel,
            &typ,
            TestRequest::key("hello").min_index(4).timeout(ms(100)),
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= ms(100));
    assert_eq!(value, Some(1));
    assert_eq!(meta.index, 4);
}

#[tokio::test]
async fn blocking_get_returns_fetch_error() {
    let cache = Cache::new(Options::default());
    let (stub, _calls) = StubType::new(|_, opts: FetchOptions<u64>, _| async move {
        if opts.min_index == 0 {
            return Ok(FetchResult::new(1, 4));
        }
        anyhow::bail!("query interrupted")
    });
    let typ = cache.register_type("t", stub, blocking());
    let cancel = CancellationToken::new();

    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    let err = cache
        .get(
            &cancel,
            &typ,
            TestRequest::key("hello").min_index(4).timeout(ms(1000)),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("query interrupted"));
}

#[tokio::test]
async fn cancelled_get_returns_promptly() {
    let cache = Cache::new(Options::default());
    let (stub, _calls) =
        StubType::<u64>::new(|_, _, _| async { std::future::pending().await });
    let typ = cache.register_type("t", stub, plain());

    let cancel = CancellationToken::new();
    let get = {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.get(&cancel, &typ, TestRequest::key("hello")).await })
    };
    sleep(ms(20)).await;
    cancel.cancel();

    let err = get.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
}

#[tokio::test]
async fn second_get_is_a_hit() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|_, _, _| async { Ok(FetchResult::new(42u64, 3)) });
    let typ = cache.register_type("t", stub, plain());
    let cancel = CancellationToken::new();

    let (_, first) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    let (value, second) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert!(!first.hit);
    assert!(second.hit);
    assert_eq!((value, second.index), (Some(42), 3));
    assert_eq!(calls.count(), 1);

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.miss_new), (1, 1));
    assert_eq!(stats.hit_rate(), 0.5);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn datacenter_and_token_partition_entries() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, 1)) });
    let typ = cache.register_type("t", stub, plain());
    let cancel = CancellationToken::new();

    let requests = [
        TestRequest::key("hello").datacenter("dc1"),
        TestRequest::key("hello").datacenter("dc2"),
        TestRequest::key("hello").datacenter("dc1").token("secret"),
    ];
    for req in &requests {
        cache.get(&cancel, &typ, req.clone()).await.unwrap();
    }
    assert_eq!(calls.count(), 3);

    for (n, req) in requests.into_iter().enumerate() {
        let (value, meta) = cache.get(&cancel, &typ, req).await.unwrap();
        assert!(meta.hit);
        assert_eq!(value, Some(n as u64 + 1));
    }
    assert_eq!(calls.count(), 3);
}

#[tokio::test]
async fn must_revalidate_forces_a_fetch() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, n)) });
    let typ = cache.register_type("t", stub, plain());
    let cancel = CancellationToken::new();

    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello").must_revalidate())
        .await
        .unwrap();
    assert_eq!(value, Some(2));
    assert!(!meta.hit);
    assert_eq!(calls.count(), 2);
    assert_eq!(calls.get(1).last_index, Some(1));
}

#[tokio::test(start_paused = true)]
async fn max_age_refetches_old_values() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, n)) });
    let typ = cache.register_type("t", stub, plain());
    let cancel = CancellationToken::new();

    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;

    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello").max_age(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(meta.hit);
    assert_eq!(value, Some(1));
    assert!(meta.age >= Duration::from_secs(2) && meta.age < Duration::from_secs(3));

    let (value, _) = cache
        .get(&cancel, &typ, TestRequest::key("hello").max_age(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(value, Some(2));
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn prepopulated_entries_are_served() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|_, _, _| async { Ok(FetchResult::new(0u64, 1)) });
    let typ = cache.register_type("t", stub, plain());

    let info = TestRequest::key("hello").datacenter("dc1").cache_info();
    cache
        .prepopulate(&typ, FetchResult::new(7, 3), &info)
        .unwrap();

    let (value, meta) = cache
        .get(
            &CancellationToken::new(),
            &typ,
            TestRequest::key("hello").datacenter("dc1"),
        )
        .await
        .unwrap();
    assert!(meta.hit);
    assert_eq!((value, meta.index), (Some(7), 3));
    assert_eq!(calls.count(), 0);
}

#[tokio::test]
async fn unregistered_type_is_rejected() {
    let other = Cache::new(Options::default());
    let (stub, _calls) = StubType::new(|_, _, _| async { Ok(FetchResult::new(1u64, 1)) });
    let typ = other.register_type("t", stub, plain());

    let cache = Cache::new(Options::default());
    let err = cache
        .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownType(name) if name == "t"));
}

#[derive(Clone)]
struct NamedRequest(String);

impl Request for NamedRequest {
    fn cache_info(&self) -> RequestInfo {
        RequestInfo {
            key: self.0.clone(),
            ..Default::default()
        }
    }
}

struct Named;

#[async_trait]
impl CacheType for Named {
    type Request = NamedRequest;
    type Value = String;

    async fn fetch(
        &self,
        _opts: FetchOptions<String>,
        req: NamedRequest,
    ) -> anyhow::Result<FetchResult<String>> {
        Ok(FetchResult::new(req.0, 1))
    }
}

#[tokio::test]
async fn replaced_registration_rejects_old_request_type() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|_, _, _| async { Ok(FetchResult::new(1u64, 1)) });
    let old = cache.register_type("t", stub, plain());
    let new = cache.register_type("t", Named, plain());

    let err = cache
        .get(&CancellationToken::new(), &old, TestRequest::key("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::WrongRequestType { .. }));
    assert_eq!(calls.count(), 0);

    let (value, _) = cache
        .get(&CancellationToken::new(), &new, NamedRequest("other".into()))
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("other"));
}

#[tokio::test(start_paused = true)]
async fn refresh_keeps_values_current() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, n)) });
    let typ = cache.register_type("t", stub, refreshing(ms(100)));
    let cancel = CancellationToken::new();

    let (value, _) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert_eq!(value, Some(1));

    sleep(ms(350)).await;
    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert!(meta.hit);
    assert_eq!(meta.age, Duration::ZERO);
    assert!(value.unwrap() >= 3);
    assert!(calls.count() >= 3);
}

#[tokio::test(start_paused = true)]
async fn failing_refreshes_back_off() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::<u64>::new(|_, _, _| async { anyhow::bail!("down") });
    let typ = cache.register_type("t", stub, refreshing(Duration::ZERO));

    assert!(
        cache
            .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
            .await
            .is_err()
    );

    // Three immediate retries, then waits of [2s, 4s) and [4s, 8s).
    sleep(Duration::from_secs(10)).await;
    let count = calls.count();
    assert!((5..=6).contains(&count), "unexpected fetch count {count}");
}

#[tokio::test(start_paused = true)]
async fn zero_index_refreshes_back_off() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|_, _, _| async { Ok(FetchResult::new(1u64, 0)) });
    let typ = cache.register_type("t", stub, refreshing(Duration::ZERO));

    let (value, meta) = cache
        .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert_eq!((value, meta.index), (Some(1), 1));

    sleep(Duration::from_secs(10)).await;
    let count = calls.count();
    assert!((5..=6).contains(&count), "unexpected fetch count {count}");
}

#[tokio::test(start_paused = true)]
async fn idle_entries_expire() {
    let cache = Cache::new(Options::default());
    let state = Arc::new(ClosedFlag::default());
    let (stub, calls) = {
        let state = state.clone();
        StubType::new(move |n, _, _| {
            let state = state.clone();
            async move { Ok(FetchResult::new(n, n).with_state(state)) }
        })
    };
    let typ = cache.register_type(
        "t",
        stub,
        RegisterOptions {
            last_get_ttl: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let cancel = CancellationToken::new();

    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    sleep(ms(500)).await;
    let (_, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert!(meta.hit);

    // The read pushed the deadline out to 1.5s.
    sleep(ms(700)).await;
    assert_eq!(cache.stats().entries, 1);
    assert!(!state.is_closed());

    sleep(ms(500)).await;
    let stats = cache.stats();
    assert_eq!((stats.entries, stats.evict_expired), (0, 1));
    assert!(state.is_closed());

    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert!(!meta.hit);
    assert_eq!(value, Some(2));
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn entry_fetch_rate_throttles_refreshes() {
    let cache = Cache::new(Options {
        entry_fetch_rate: Some(5.0),
        entry_fetch_max_burst: 1,
    });
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, n)) });
    let typ = cache.register_type("t", stub, refreshing(Duration::ZERO));

    cache
        .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    sleep(ms(500)).await;
    cache.close();

    let count = calls.count();
    assert!((2..=4).contains(&count), "unexpected fetch count {count}");
}

#[tokio::test]
async fn reload_options_reports_changes() {
    let cache = Cache::new(Options::default());
    assert!(!cache.reload_options(Options::default()));

    let limited = Options {
        entry_fetch_rate: Some(1.0),
        entry_fetch_max_burst: 1,
    };
    assert!(cache.reload_options(limited.clone()));
    assert!(!cache.reload_options(limited));

    // Invalid rates normalize to unlimited.
    assert!(cache.reload_options(Options {
        entry_fetch_rate: Some(-1.0),
        entry_fetch_max_burst: 0,
    }));
    assert!(!cache.reload_options(Options::default()));
}

#[tokio::test(start_paused = true)]
async fn close_stops_refreshing() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|n, _, _| async move { Ok(FetchResult::new(n, n)) });
    let typ = cache.register_type("t", stub, refreshing(ms(100)));

    cache
        .get(&CancellationToken::new(), &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    cache.close();
    cache.close();
    assert!(cache.is_closed());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn not_modified_keeps_the_value_and_takes_the_index() {
    let cache = Cache::new(Options::default());
    let (stub, calls) = StubType::new(|_, opts: FetchOptions<u64>, _| async move {
        Ok(match opts.last_result {
            Some(last) => FetchResult::not_modified(last.index + 5),
            None => FetchResult::new(42u64, 3),
        })
    });
    let typ = cache.register_type("t", stub, blocking());
    let cancel = CancellationToken::new();

    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();
    assert_eq!((value, meta.index), (Some(42), 3));

    let (value, meta) = cache
        .get(
            &cancel,
            &typ,
            TestRequest::key("hello").min_index(3).timeout(ms(1000)),
        )
        .await
        .unwrap();
    assert_eq!((value, meta.index), (Some(42), 8));
    assert!(!meta.hit);

    assert_eq!(calls.count(), 2);
    assert_eq!(calls.get(0).last_index, None);
    assert_eq!(calls.get(1).last_index, Some(3));
}

#[tokio::test(start_paused = true)]
async fn fetch_finishing_after_eviction_does_not_restore_the_entry() {
    let cache = Cache::new(Options::default());
    let gate = Arc::new(Semaphore::new(0));
    let (stub, calls) = {
        let gate = gate.clone();
        StubType::new(move |n, _, _| {
            let gate = gate.clone();
            async move {
                if n == 2 {
                    gate.acquire().await.expect("gate closed").forget();
                }
                Ok(FetchResult::new(n, n))
            }
        })
    };
    let typ = cache.register_type(
        "t",
        stub,
        RegisterOptions {
            last_get_ttl: Duration::from_secs(1),
            ..blocking()
        },
    );
    let cancel = CancellationToken::new();

    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();

    let blocked = {
        let cache = cache.clone();
        let typ = typ.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let req = TestRequest::key("hello").min_index(1).timeout(Duration::from_secs(30));
            cache.get(&cancel, &typ, req).await
        })
    };

    sleep(Duration::from_secs(2)).await;
    let stats = cache.stats();
    assert_eq!((stats.entries, stats.evict_expired), (0, 1));
    assert_eq!(calls.count(), 2);

    let released = tokio::time::Instant::now();
    gate.add_permits(1);
    let (value, meta) = blocked.await.unwrap().unwrap();
    assert!(released.elapsed() < Duration::from_secs(1));

    // The evicted fetch's result was dropped; the woken read fetched anew.
    assert_eq!((value, meta.index), (Some(3), 3));
    assert_eq!(calls.count(), 3);
    assert_eq!(calls.get(2).min_index, 0);
}

#[tokio::test(start_paused = true)]
async fn prepopulate_during_a_fetch_keeps_one_expiry() {
    let cache = Cache::new(Options::default());
    let gate = Arc::new(Semaphore::new(0));
    let (stub, calls) = {
        let gate = gate.clone();
        StubType::new(move |_, _, _| {
            let gate = gate.clone();
            async move {
                gate.acquire().await.expect("gate closed").forget();
                Ok(FetchResult::new(42u64, 5))
            }
        })
    };
    let typ = cache.register_type(
        "t",
        stub,
        RegisterOptions {
            last_get_ttl: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let cancel = CancellationToken::new();

    let first = {
        let cache = cache.clone();
        let typ = typ.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.get(&cancel, &typ, TestRequest::key("hello")).await })
    };
    sleep(ms(10)).await;

    let info = TestRequest::key("hello").cache_info();
    cache
        .prepopulate(&typ, FetchResult::new(7, 3), &info)
        .unwrap();

    // The running fetch still counts as revalidating.
    let (value, meta) = cache
        .get(&cancel, &typ, TestRequest::key("hello").must_revalidate())
        .await
        .unwrap();
    assert!(meta.hit);
    assert_eq!(value, Some(7));
    assert_eq!(calls.count(), 1);

    gate.add_permits(1);
    let (value, meta) = first.await.unwrap().unwrap();
    assert_eq!((value, meta.index), (Some(42), 5));

    sleep(Duration::from_secs(2)).await;
    let stats = cache.stats();
    assert_eq!((stats.entries, stats.evict_expired), (0, 1));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(cache.stats().evict_expired, 1);
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn failed_blocking_read_hands_back_the_stored_value() {
    let cache = Cache::new(Options::default());
    let (stub, _calls) = StubType::new(|n, _, _| async move {
        if n > 1 {
            anyhow::bail!("backend unavailable");
        }
        Ok(FetchResult::new(42u64, 3))
    });
    let typ = cache.register_type("t", stub, blocking());
    let cancel = CancellationToken::new();
    cache
        .get(&cancel, &typ, TestRequest::key("hello"))
        .await
        .unwrap();

    let newer = || TestRequest::key("hello").min_index(3).timeout(ms(1000));
    let stale = cache
        .get_or_stale(&cancel, &typ, newer())
        .await
        .unwrap_err();
    assert!(matches!(stale.err, CacheError::Fetch(_)));
    assert_eq!(stale.value, Some(42));
    assert_eq!(stale.meta.index, 3);

    let err = cache.get(&cancel, &typ, newer()).await.unwrap_err();
    assert!(err.to_string().contains("backend unavailable"));
}
