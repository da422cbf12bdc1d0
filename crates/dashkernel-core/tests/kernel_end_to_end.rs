//! End-to-end scenarios across the primitives and the task manager.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashkernel_core::impls::{BroadcastObserver, InMemoryTaskStore};
use dashkernel_core::ports::CancelFn;
use dashkernel_core::{
    ConcurrencyKernel, KernelError, RateLimiter, Semaphore, TaskInfo, TaskManager, TaskStatus,
    WaitOptions,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn capacity_one_runs_queued_work_in_order() {
    let sem = Semaphore::new(1, "ffmpeg").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = sem.acquire(WaitOptions::unbounded()).await.unwrap();

    let mut jobs = Vec::new();
    for name in ["B", "C"] {
        let worker = sem.clone();
        let order = Arc::clone(&order);
        jobs.push(tokio::spawn(async move {
            worker.run_exclusive(WaitOptions::unbounded(), || async move {
                order.lock().unwrap().push(name);
                tokio::task::yield_now().await;
                Ok::<_, KernelError>(())
            })
            .await
        }));
        let queued = jobs.len();
        while sem.snapshot().waiting < queued {
            tokio::task::yield_now().await;
        }
    }

    assert_eq!(sem.snapshot().waiting, 2);
    assert_eq!(sem.snapshot().in_use, 1);

    a.release();
    for job in jobs {
        job.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["B", "C"]);
    let snap = sem.snapshot();
    assert_eq!(snap.in_use, 0);
    assert_eq!(snap.waiting, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_use_stays_within_capacity_under_contention() {
    let sem = Semaphore::new(3, "download").unwrap();
    let peak = Arc::new(Mutex::new(0usize));

    let mut jobs = Vec::new();
    for _ in 0..32 {
        let sem = sem.clone();
        let peak = Arc::clone(&peak);
        jobs.push(tokio::spawn(async move {
            let watcher = sem.clone();
            sem.run_exclusive(WaitOptions::unbounded(), || async move {
                let in_use = watcher.snapshot().in_use;
                {
                    let mut peak = peak.lock().unwrap();
                    *peak = (*peak).max(in_use);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok::<_, KernelError>(())
            })
            .await
        }));
    }
    for job in jobs {
        job.await.unwrap().unwrap();
    }

    assert!(*peak.lock().unwrap() <= 3);
    assert_eq!(sem.snapshot().in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_burst_spills_into_the_next_window() {
    let limiter = RateLimiter::new(2, Duration::from_millis(500), "gpt").unwrap();
    let start = tokio::time::Instant::now();

    let mut jobs = Vec::new();
    for i in 0..5u32 {
        let limiter = limiter.clone();
        jobs.push(tokio::spawn(async move {
            limiter
                .schedule(WaitOptions::unbounded(), || async move {
                    Ok::<_, KernelError>((i, tokio::time::Instant::now()))
                })
                .await
                .unwrap()
        }));
    }

    let mut done = Vec::new();
    for job in jobs {
        done.push(job.await.unwrap());
    }

    let mut offsets: Vec<u128> = done.iter().map(|(_, at)| (*at - start).as_millis()).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 0, 500, 500, 1000]);
}

#[tokio::test]
async fn cancelled_task_stops_at_its_checkpoint() {
    let store = Arc::new(InMemoryTaskStore::new());
    let observer = Arc::new(BroadcastObserver::new(32));
    let mut updates = observer.subscribe();
    let manager = TaskManager::builder(store.clone())
        .observer(observer.clone())
        .build()
        .unwrap();
    let kernel = ConcurrencyKernel::with_defaults();

    let id = manager.create().await.unwrap();
    let token = CancellationToken::new();
    manager.register_task(id, token.clone());

    let worker = tokio::spawn({
        let manager = manager.clone();
        let token = token.clone();
        async move {
            kernel
                .with_semaphore("whisper", WaitOptions::unbounded(), move || async move {
                    for step in 0.. {
                        manager.check_cancel(id)?;
                        manager.process(id, TaskInfo::progress(format!("segment {step}")));
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                        }
                    }
                    Ok::<_, KernelError>(())
                })
                .await
        }
    });

    // wait until the worker has reported progress at least once
    loop {
        let task = updates.recv().await.unwrap();
        if task.status == TaskStatus::InProgress {
            break;
        }
    }
    manager.cancel(id);
    assert!(token.is_cancelled());

    let err = worker.await.unwrap().unwrap_err();
    assert!(matches!(err, KernelError::TaskCancelled(got) if got == id));

    let task = manager.detail(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.progress.unwrap().starts_with("segment "));

    manager.flush().await;
    assert_eq!(store.row(id).unwrap().status, "cancelled");
}

#[tokio::test]
async fn handle_registered_after_cancel_fires_synchronously() {
    let manager = TaskManager::builder(Arc::new(InMemoryTaskStore::new()))
        .build()
        .unwrap();
    let id = manager.create().await.unwrap();
    manager.cancel(id);

    let fired = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&fired);
    manager.register_task(
        id,
        CancelFn::new(move || {
            *flag.lock().unwrap() = true;
        }),
    );

    assert!(*fired.lock().unwrap());
}

#[tokio::test]
async fn startup_sweep_then_fresh_work() {
    let store = Arc::new(InMemoryTaskStore::new());

    // a previous run that crashed mid-task
    {
        let crashed = TaskManager::builder(store.clone()).build().unwrap();
        let id = crashed.create().await.unwrap();
        crashed.process(id, TaskInfo::progress("downloading 40%"));
        crashed.flush().await;
    }

    let manager = TaskManager::builder(store.clone()).build().unwrap();
    assert_eq!(manager.cancel_all().await.unwrap(), 1);

    let id = manager.create().await.unwrap();
    manager.finish(id, TaskInfo::result("{}"));
    let report = manager.flush().await;
    assert!(report.is_clean());
    assert_eq!(store.row(id).unwrap().status, "done");
}
