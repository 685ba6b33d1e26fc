mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use asyncmodel::bridge::{Bridge, WorkerPool, can_block};
use asyncmodel::prelude::*;
use asyncmodel::query::{Backend, BlockingQuerySet};
use common::{backend, backend_with, database};

#[tokio::test]
async fn test_sync_to_async_returns_the_callable_value() {
    let lookup = sync_to_async(|name: &'static str| name.len());
    assert_eq!(lookup.call("margherita").await.unwrap(), 10);
}

#[tokio::test]
async fn test_callables_run_where_blocking_is_allowed() {
    assert!(!can_block());
    let inside = sync_to_async(|_: ()| can_block()).call(()).await.unwrap();
    assert!(inside);
}

#[tokio::test]
async fn test_thread_sensitive_scope_pins_calls() {
    let bridge = Bridge::new(&BridgeConfig::new().max_workers(4));
    let (first, second) = thread_sensitive_scope(async {
        let first = bridge.run(|| std::thread::current().id()).await.unwrap();
        let second = bridge.run(|| std::thread::current().id()).await.unwrap();
        (first, second)
    })
    .await
    .unwrap();
    assert_eq!(first, second);
    assert_ne!(first, std::thread::current().id());
}

#[tokio::test]
async fn test_pool_bounds_concurrency() {
    let pool = Arc::new(WorkerPool::new(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut calls = Vec::new();
    for _ in 0..6 {
        let pool = Arc::clone(&pool);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        calls.push(tokio::spawn(async move {
            pool.run(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.stats().completed, 6);
    assert_eq!(pool.available_permits(), 2);
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let pool = Arc::new(WorkerPool::new(1).with_acquire_timeout(Duration::from_millis(20)));
    let busy = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.run(|| std::thread::sleep(Duration::from_millis(200)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pool.run(|| ()).await.unwrap_err();
    assert!(err.is_scheduling());
    busy.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shut_down_pool_refuses_calls() {
    let pool = WorkerPool::new(1);
    pool.shutdown();
    assert!(pool.is_shutdown());
    assert!(pool.run(|| ()).await.unwrap_err().is_scheduling());
}

#[tokio::test]
async fn test_cancelled_await_lets_the_call_finish() {
    let pool = Arc::new(WorkerPool::new(1));
    let done = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&done);
    let abandoned = pool.run(move || {
        std::thread::sleep(Duration::from_millis(50));
        flag.fetch_add(1, Ordering::SeqCst);
    });
    let outcome = tokio::time::timeout(Duration::from_millis(5), abandoned).await;
    assert!(outcome.is_err());

    // The permit comes back once the abandoned call returns.
    pool.run(|| ()).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_strict_backend_refuses_the_runtime_thread() {
    let backend = backend();
    let pizzas = backend.objects("pizza").unwrap();
    match pizzas.count() {
        Err(ModelError::SynchronousOnlyOperation(op)) => assert_eq!(op, "count"),
        other => panic!("expected SynchronousOnlyOperation, got {:?}", other),
    }
    assert_eq!(backend.stats().blocking_calls, 0);
}

#[tokio::test]
async fn test_lenient_backend_allows_direct_calls() {
    let backend = backend_with(|builder| builder.allow_async_context(true));
    let boxes = backend.objects("box").unwrap();
    assert_eq!(boxes.count().unwrap(), 0);
}

#[test]
fn test_blocking_callers_may_use_the_backend_directly() {
    let backend = backend();
    assert!(can_block());
    let boxes = backend.objects("box").unwrap();
    boxes.create(fields! { "name" => "plain" }).unwrap();
    assert_eq!(boxes.count().unwrap(), 1);
}

#[tokio::test]
async fn test_database_calls_go_through_the_bridge() {
    let db = database();
    let before = db.bridge().pool().stats().completed;
    let boxes = db.objects("box").unwrap();
    assert_eq!(boxes.count().await.unwrap(), 0);
    assert!(boxes.exists().await.is_ok());

    // Unscoped thread-sensitive calls run on the database's own pool.
    assert_eq!(db.bridge().pool().stats().completed, before + 2);
}

#[tokio::test]
async fn test_shut_down_database_pool_refuses_calls() {
    let db = AsyncDatabase::with_config(
        backend(),
        BridgeConfig::new()
            .max_workers(1)
            .acquire_timeout(Duration::from_millis(10)),
    )
    .unwrap();
    assert!(db.bridge().is_thread_sensitive());
    db.bridge().pool().shutdown();

    let boxes = db.objects("box").unwrap();
    assert!(boxes.count().await.unwrap_err().is_scheduling());

    let scoped = thread_sensitive_scope(async { boxes.count().await }).await.unwrap();
    assert!(scoped.unwrap_err().is_scheduling());
}

#[tokio::test]
async fn test_exhausted_database_pool_times_out() {
    let db = AsyncDatabase::with_config(
        backend(),
        BridgeConfig::new()
            .max_workers(1)
            .acquire_timeout(Duration::from_millis(10)),
    )
    .unwrap();
    let busy = {
        let db = db.clone();
        tokio::spawn(async move {
            db.run("busy", |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
        })
    };
    while db.bridge().pool().available_permits() > 0 {
        tokio::task::yield_now().await;
    }

    let err = db.objects("box").unwrap().count().await.unwrap_err();
    assert!(err.is_scheduling());
    busy.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_non_thread_sensitive_database_uses_its_pool() {
    let db = AsyncDatabase::with_config(
        backend(),
        BridgeConfig::new().thread_sensitive(false).max_workers(2),
    )
    .unwrap();
    let boxes = db.objects("box").unwrap();
    boxes.create(fields! { "name" => "pooled" }).await.unwrap();
    assert_eq!(boxes.count().await.unwrap(), 1);
    assert_eq!(db.bridge().pool().stats().completed, 2);
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = AsyncDatabase::with_config(backend(), BridgeConfig::new().max_workers(0)).unwrap_err();
    assert!(matches!(err, ModelError::Configuration(_)));

    let db = AsyncDatabase::with_config(backend(), BridgeConfig::new().max_workers(3)).unwrap();
    assert!(format!("{:?}", db).starts_with("AsyncDatabase"));

    let parsed = BridgeConfig::from_json(r#"{"max_workers": 3, "accessor_prefix": "async_"}"#).unwrap();
    assert_eq!(parsed.max_workers, 3);
    assert!(parsed.thread_sensitive);
    assert!(BridgeConfig::from_json(r#"{"default_alias": ""}"#).is_err());
}

#[test]
fn test_async_to_sync_from_plain_thread() {
    let total = async_to_sync(|(a, b): (i64, i64)| async move {
        tokio::task::yield_now().await;
        a + b
    });
    assert_eq!(total.call((2, 40)).unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_to_sync_inside_sync_to_async() {
    let db = database();
    let inner = db.clone();
    let count = sync_to_async(move |_: ()| {
        async_to_sync(|db: common::Db| async move { db.objects("topping")?.count().await })
            .call(inner.clone())
    })
    .call(())
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(count, 0);
}

thread_local! {
    static CALLS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

#[tokio::test]
async fn test_thread_sensitive_calls_share_thread_state() {
    let bump = sync_to_async(|_: ()| {
        CALLS.with(|calls| {
            calls.set(calls.get() + 1);
            calls.get()
        })
    });
    let seen = thread_sensitive_scope(async {
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(bump.call(()).await.unwrap());
        }
        seen
    })
    .await
    .unwrap();
    assert_eq!(seen, vec![1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelling_one_task_leaves_others_alone() {
    let db = database();
    let slow = {
        let db = db.clone();
        tokio::spawn(async move {
            db.run("slow", |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
        })
    };
    let steady = {
        let db = db.clone();
        tokio::spawn(async move {
            let boxes = db.objects("box")?;
            boxes.create(fields! { "name" => "steady" }).await?;
            boxes.count().await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    slow.abort();
    assert!(slow.await.unwrap_err().is_cancelled());
    assert_eq!(steady.await.unwrap().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_call_does_not_delay_unrelated_tasks() {
    let db = database();
    let slow = {
        let db = db.clone();
        tokio::spawn(async move {
            db.run("slow", |_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    slow.abort();
    let _ = slow.await;

    let started = std::time::Instant::now();
    let boxes = db.objects("box").unwrap();
    assert_eq!(boxes.count().await.unwrap(), 0);
    assert!(started.elapsed() < Duration::from_millis(200));
}
