use anyhow::Result;
use mlops_core::{init_tracing, load_config, object_store, persist_report, run_load_test, HttpSender, LoadTestConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("load-tester")?;
    let cfg = load_config("load-tester")?;
    let lt = LoadTestConfig::from_pipeline(&cfg);

    // blocking client and worker pool stay off the async executor threads
    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let sender = HttpSender::new(lt.request_timeout)?;
        Ok(run_load_test(&lt, &sender)?)
    })
    .await??;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if cfg.persist_report {
        match object_store(&cfg).await {
            Ok(store) => match persist_report(store.as_ref(), &cfg.s3_bucket, &summary).await {
                Ok(location) => info!(%location, "load test report stored"),
                Err(e) => warn!(error = %e, "failed to store load test report"),
            },
            Err(e) => warn!(error = %e, "no object store for load test report"),
        }
    }
    Ok(())
}
