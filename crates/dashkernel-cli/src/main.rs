use std::sync::Arc;
use std::time::Duration;

use dashkernel_core::impls::{BroadcastObserver, InMemoryTaskStore};
use dashkernel_core::sync::DEFAULT_SCHEDULER;
use dashkernel_core::{
    ConcurrencyKernel, ConcurrencyProfiles, KernelError, TaskId, TaskInfo, TaskManager,
    TaskManagerConfig, WaitOptions,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Pretend transcode: ten chunks, a checkpoint before each one.
async fn transcode(
    manager: TaskManager,
    kernel: Arc<ConcurrencyKernel>,
    id: TaskId,
) -> Result<(), KernelError> {
    let token = CancellationToken::new();
    manager.register_task(id, token.clone());

    let work = kernel.with_semaphore("ffmpeg", WaitOptions::unbounded(), {
        let manager = manager.clone();
        let kernel = kernel.clone();
        move || async move {
            for chunk in 1..=10 {
                manager.check_cancel(id)?;
                kernel.yield_if_needed(DEFAULT_SCHEDULER).await?;
                manager.process(id, TaskInfo::progress(format!("transcoding {}%", chunk * 10)));
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(Duration::from_millis(200)) => {}
                }
            }
            Ok::<_, KernelError>(())
        }
    });

    match work.await {
        Ok(()) => {
            manager.finish(id, TaskInfo::result(r#"{"output":"clip.mp4"}"#));
            Ok(())
        }
        // already written as CANCELLED by the checkpoint
        Err(e) if e.is_cancellation() => Err(e),
        Err(e) => {
            manager.fail(id, TaskInfo::progress(e.to_string()));
            Err(e)
        }
    }
}

/// Pretend AI call behind the `gpt` rate limit.
async fn translate(
    manager: TaskManager,
    kernel: Arc<ConcurrencyKernel>,
    id: TaskId,
) -> Result<(), KernelError> {
    let opts = WaitOptions::unbounded().with_timeout(Duration::from_secs(5));
    kernel
        .with_rate_limit("gpt", opts, {
            let manager = manager.clone();
            move || async move {
                manager.process(id, TaskInfo::progress("translating"));
                sleep(Duration::from_millis(100)).await;
                Ok::<_, KernelError>(())
            }
        })
        .await?;
    manager.finish(id, TaskInfo::result(r#"{"lines":42}"#));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), KernelError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) store / observer / manager を用意
    let store = Arc::new(InMemoryTaskStore::new());
    let observer = Arc::new(BroadcastObserver::new(64));
    let mut updates = observer.subscribe();

    let config = match std::env::var("DASHKERNEL_TASKS") {
        Ok(json) => TaskManagerConfig::from_json(&json)?,
        Err(_) => TaskManagerConfig {
            flush_interval_ms: 500,
            ..TaskManagerConfig::default()
        },
    };
    let manager = TaskManager::builder(store.clone())
        .observer(observer.clone())
        .config(config)
        .build()?;

    let profiles = match std::env::var("DASHKERNEL_PROFILES") {
        Ok(json) => ConcurrencyProfiles::from_json(&json)?,
        Err(_) => ConcurrencyProfiles::defaults(),
    };
    let kernel = Arc::new(ConcurrencyKernel::new(profiles)?);

    // (B) 起動時の掃除 + flush ループ
    manager.cancel_all().await?;
    let flush_loop = manager.spawn_flush_loop();

    let printer = tokio::spawn(async move {
        while let Ok(task) = updates.recv().await {
            info!(
                task_id = %task.id,
                status = %task.status,
                progress = task.progress.as_deref().unwrap_or(""),
                "update"
            );
        }
    });

    // (C) ジョブ投入
    let transcode_id = manager.create().await?;
    let translate_id = manager.create().await?;
    let transcode_job = tokio::spawn(transcode(manager.clone(), kernel.clone(), transcode_id));
    let translate_job = tokio::spawn(translate(manager.clone(), kernel.clone(), translate_id));

    // (D) UI からのキャンセル
    sleep(Duration::from_millis(700)).await;
    manager.cancel(transcode_id);

    for (name, job) in [("transcode", transcode_job), ("translate", translate_job)] {
        match job.await {
            Ok(Ok(())) => info!(job = name, "job finished"),
            Ok(Err(e)) => warn!(job = name, error = %e, "job stopped"),
            Err(e) => warn!(job = name, error = %e, "job panicked"),
        }
    }

    // (E) 状態確認 + 停止
    let snapshot = kernel.snapshot();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "snapshot not serializable"),
    }

    flush_loop.shutdown_and_join().await;
    for (id, task) in manager.details(&[transcode_id, translate_id]).await? {
        println!("{id}: {} {:?}", task.status, task.progress);
    }

    drop(manager);
    drop(observer);
    printer.abort();
    Ok(())
}
