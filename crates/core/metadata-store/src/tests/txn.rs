use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use super::fixtures::{PROJECT, Widget, memory_store};
use crate::{
    CachedCrud, CrudError, RetriesExhausted, RetryPolicy, RetryableErrorExt, StoreError,
    TransactionScope,
};

#[derive(Debug, thiserror::Error)]
enum TestError {
    #[error(transparent)]
    Crud(#[from] CrudError),
    #[error(transparent)]
    Exhausted(#[from] RetriesExhausted),
    #[error("invalid input")]
    Invalid,
}

impl RetryableErrorExt for TestError {
    fn is_retryable(&self) -> bool {
        match self {
            TestError::Crud(err) => err.is_retryable(),
            TestError::Exhausted(_) | TestError::Invalid => false,
        }
    }
}

fn conflict() -> TestError {
    TestError::Crud(CrudError::Store(StoreError::VersionConflict {
        path: "p/widget/a.json".to_string(),
        expected: 0,
        actual: Some(1),
    }))
}

fn fast_scope(max_retries: usize) -> TransactionScope {
    TransactionScope::new(RetryPolicy {
        max_retries,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    })
}

#[tokio::test]
async fn conflicting_unit_is_retried_until_it_succeeds() {
    //* Given
    let scope = fast_scope(5);
    let attempts = AtomicUsize::new(0);

    //* When
    let result = scope
        .run("flaky", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(42)
            }
        })
        .await;

    //* Then
    assert_eq!(result.expect("third attempt should succeed"), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fatal_error_is_not_retried() {
    //* Given
    let scope = fast_scope(5);
    let attempts = AtomicUsize::new(0);

    //* When
    let result: Result<(), TestError> = scope
        .run("invalid", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Invalid)
        })
        .await;

    //* Then
    assert!(matches!(result, Err(TestError::Invalid)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "fatal errors run once");
}

#[tokio::test]
async fn exhausted_retries_surface_as_retries_exhausted() {
    //* Given
    let scope = fast_scope(2);

    //* When
    let result: Result<(), TestError> = scope.run("hopeless", || async { Err(conflict()) }).await;

    //* Then
    match result {
        Err(TestError::Exhausted(err)) => {
            assert_eq!(err.unit, "hopeless");
            assert_eq!(err.attempts, 3, "one attempt plus two retries");
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_all_commit() {
    //* Given
    let store = memory_store();
    let seed = CachedCrud::<Widget>::new(PROJECT, Arc::clone(&store));
    seed.save(Widget::new("counter", 0))
        .await
        .expect("seed save should succeed");

    //* When
    let mut handles = Vec::new();
    for _ in 0..4 {
        let crud = CachedCrud::<Widget>::new(PROJECT, Arc::clone(&store));
        let scope = TransactionScope::new(RetryPolicy {
            max_retries: 20,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        });
        handles.push(tokio::spawn(async move {
            scope
                .run("increment", || async {
                    let current = crud
                        .get("counter")
                        .await?
                        .expect("counter should exist");
                    let mut copy = crud.copy_for_write(&current);
                    copy.value += 1;
                    crud.save(copy).await?;
                    Ok::<_, TestError>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle
            .await
            .expect("task should not panic")
            .expect("increment should commit");
    }

    //* Then
    let fresh = CachedCrud::<Widget>::new(PROJECT, store);
    let counter = fresh
        .get("counter")
        .await
        .expect("get should succeed")
        .expect("counter should exist");
    assert_eq!(counter.value, 4, "every increment should be applied exactly once");
}
