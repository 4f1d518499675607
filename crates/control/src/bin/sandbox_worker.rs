use std::env;
use std::time::Duration;

use control::broker::{AmqpBroker, Broker, Envelope};
use control::protocol::{FileRef, JobMessage, ResultMessage, WorkerId, job_queue_name};
use control::{
    ENV_BROKER_URL, ENV_EXECUTION_TIMEOUT_SECS, ENV_OUTBOUND_PROXY, ENV_RESULT_UPLOAD_URL,
    ENV_WORKER_ID, ENV_WORKER_LANGUAGE,
};
use runner::{CommandExecutor, ExecConfig, Executor, Toolchain, Uploader};

const ENV_RUNTIME_VERSION: &str = "RUNTIME_VERSION";
const ENV_DOTNET_PROJECT_DIR: &str = "DOTNET_PROJECT_DIR";

struct WorkerEnv {
    worker_id: WorkerId,
    language: String,
    broker_url: String,
    result_upload_url: String,
    outbound_proxy: Option<String>,
    execution_timeout: Duration,
    version: String,
}

fn worker_env() -> Result<WorkerEnv, Box<dyn std::error::Error>> {
    let required = |key: &'static str| {
        env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| format!("{key} is required for the sandbox worker"))
    };
    let execution_timeout = match env::var(ENV_EXECUTION_TIMEOUT_SECS) {
        Ok(value) => Duration::from_secs(
            value
                .trim()
                .parse()
                .map_err(|err| format!("invalid {ENV_EXECUTION_TIMEOUT_SECS}: {err}"))?,
        ),
        Err(_) => ExecConfig::default().timeout,
    };
    Ok(WorkerEnv {
        worker_id: WorkerId::from(required(ENV_WORKER_ID)?),
        language: required(ENV_WORKER_LANGUAGE)?,
        broker_url: required(ENV_BROKER_URL)?,
        result_upload_url: required(ENV_RESULT_UPLOAD_URL)?,
        outbound_proxy: env::var(ENV_OUTBOUND_PROXY)
            .ok()
            .filter(|value| !value.trim().is_empty()),
        execution_timeout,
        version: env::var(ENV_RUNTIME_VERSION).unwrap_or_default(),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = worker_env()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(serve_one(config))
}

/// Takes exactly one job from this worker's queue, answers it and returns.
async fn serve_one(config: WorkerEnv) -> Result<(), Box<dyn std::error::Error>> {
    let broker = AmqpBroker::connect(&config.broker_url).await?;
    let queue = job_queue_name(&config.worker_id);
    let mut deliveries = broker.consume(&queue).await?;
    tracing::info!(worker_id = %config.worker_id, language = %config.language, %queue, "waiting for job");

    let envelope = deliveries
        .recv()
        .await
        .ok_or_else(|| format!("{queue} closed before a job arrived"))?;
    let Some(reply_to) = envelope.reply_to.clone() else {
        return Err("job arrived without a reply queue".into());
    };
    let correlation_id = envelope.correlation_id.clone().unwrap_or_default();

    let result = match serde_json::from_slice::<JobMessage>(&envelope.body) {
        Ok(job) => run_job(&config, job).await,
        Err(err) => ResultMessage {
            success: false,
            error: format!("invalid job message: {err}"),
            version: config.version.clone(),
            ..ResultMessage::default()
        },
    };
    tracing::info!(
        worker_id = %config.worker_id,
        %correlation_id,
        success = result.success,
        files = result.files.len(),
        "publishing result"
    );

    let body = serde_json::to_vec(&result)?;
    broker
        .publish(
            &reply_to,
            Envelope::new(body).with_correlation_id(correlation_id),
        )
        .await?;
    Ok(())
}

async fn run_job(config: &WorkerEnv, job: JobMessage) -> ResultMessage {
    let mut result = ResultMessage {
        version: config.version.clone(),
        ..ResultMessage::default()
    };
    let toolchain = match Toolchain::for_language(&config.language) {
        Ok(Toolchain::DotNet { project_dir }) => Toolchain::DotNet {
            project_dir: env::var(ENV_DOTNET_PROJECT_DIR)
                .map(Into::into)
                .unwrap_or(project_dir),
        },
        Ok(toolchain) => toolchain,
        Err(err) => {
            result.error = err.to_string();
            return result;
        }
    };

    let mut child_env = Vec::new();
    if let Some(request_id) = &job.request_id {
        child_env.push(("REQUEST_ID".to_owned(), request_id.clone()));
    }
    let executor = CommandExecutor::new(
        toolchain,
        ExecConfig {
            timeout: config.execution_timeout,
            outbound_proxy: config.outbound_proxy.clone(),
            env: child_env,
        },
    );
    let output = match executor.execute(&job.code).await {
        Ok(output) => output,
        Err(err) => {
            tracing::error!(error = %err, "execution failed to start");
            result.error = err.to_string();
            return result;
        }
    };
    tracing::info!(
        success = output.success,
        elapsed_ms = output.elapsed.as_millis() as u64,
        "execution finished"
    );

    result.success = output.success;
    result.error = output.error;
    result.output = output.output;
    if result.success && !output.files.is_empty() {
        let uploaded = match Uploader::new(&config.result_upload_url) {
            Ok(uploader) => {
                uploader
                    .upload(&output.files, job.request_id.as_deref())
                    .await
            }
            Err(err) => Err(err),
        };
        match uploaded {
            Ok(files) => result.files = files.into_iter().map(FileRef::from).collect(),
            Err(err) => {
                tracing::error!(error = %err, "file upload failed");
                result.success = false;
                result.error = format!("could not upload files: {err}");
            }
        }
    }
    result
}
