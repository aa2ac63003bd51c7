//! Queue operations for operators: inspect counts, list and re-submit
//! failed jobs, enqueue jobs by hand.

use std::collections::HashMap;

use mvault_models::{
    JobId, JobOptions, MediaId, MediaType, PostId, ProcessMediaPayload, ProfileImagePayload,
};
use mvault_queue::{JobQueue, QueueJob};

use crate::error::{WorkerError, WorkerResult};

pub const USAGE: &str = "\
usage: mvault-admin <command>

commands:
  counts                          queue depth per state
  failed [limit]                  failed jobs with last error and attempts
  retry <job-id>                  re-submit one failed job
  retry-all                       re-submit every failed job
  enqueue-media --post <id> --media <id> --url <url> --type <video|image> --username <name>
  enqueue-profile --username <name> --url <url> --context <name>";

const DEFAULT_FAILED_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Counts,
    Failed { limit: usize },
    Retry(JobId),
    RetryAll,
    Enqueue(QueueJob),
}

impl AdminCommand {
    /// Parse arguments after the program name.
    pub fn parse<I, S>(args: I) -> WorkerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let (command, rest) = args
            .split_first()
            .ok_or_else(|| WorkerError::invalid_job("missing command"))?;

        match command.as_str() {
            "counts" => Ok(Self::Counts),
            "failed" => {
                let limit = match rest.first() {
                    Some(raw) => raw
                        .parse()
                        .map_err(|_| WorkerError::invalid_job(format!("invalid limit: {}", raw)))?,
                    None => DEFAULT_FAILED_LIMIT,
                };
                Ok(Self::Failed { limit })
            }
            "retry" => rest
                .first()
                .map(|id| Self::Retry(JobId::from(id.as_str())))
                .ok_or_else(|| WorkerError::invalid_job("retry needs a job id")),
            "retry-all" => Ok(Self::RetryAll),
            "enqueue-media" => {
                let flags = parse_flags(rest)?;
                let raw_type = required(&flags, "type")?;
                let media_type = MediaType::parse(raw_type)
                    .ok_or_else(|| WorkerError::invalid_job(format!("unknown media type: {}", raw_type)))?;
                Ok(Self::Enqueue(QueueJob::ProcessMedia(ProcessMediaPayload {
                    post_id: PostId::from(required(&flags, "post")?),
                    media_id: MediaId::from(required(&flags, "media")?),
                    url: required(&flags, "url")?.to_string(),
                    media_type,
                    username: required(&flags, "username")?.to_string(),
                })))
            }
            "enqueue-profile" => {
                let flags = parse_flags(rest)?;
                Ok(Self::Enqueue(QueueJob::ProcessProfileImage(ProfileImagePayload {
                    username: required(&flags, "username")?.to_string(),
                    url: required(&flags, "url")?.to_string(),
                    context_username: required(&flags, "context")?.to_string(),
                })))
            }
            other => Err(WorkerError::invalid_job(format!("unknown command: {}", other))),
        }
    }

    /// Execute against `queue`, returning printable output.
    pub async fn run(&self, queue: &dyn JobQueue, options: JobOptions) -> WorkerResult<String> {
        match self {
            Self::Counts => {
                let counts = queue.counts().await?;
                Ok(serde_json::to_string_pretty(&counts)?)
            }
            Self::Failed { limit } => {
                let failed = queue.list_failed(*limit).await?;
                if failed.is_empty() {
                    return Ok("no failed jobs".to_string());
                }
                let lines: Vec<String> = failed
                    .iter()
                    .map(|job| {
                        format!(
                            "{}\t{}\tattempts={}\t{}",
                            job.id,
                            job.kind,
                            job.attempts_made,
                            job.last_error.as_deref().unwrap_or("-")
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            Self::Retry(job_id) => {
                queue.retry(job_id).await?;
                Ok(format!("re-submitted {}", job_id))
            }
            Self::RetryAll => {
                let count = queue.retry_all_failed().await?;
                Ok(format!("re-submitted {} jobs", count))
            }
            Self::Enqueue(job) => {
                let job_id = queue.enqueue(job.clone(), options).await?;
                Ok(format!("enqueued {} {}", job.kind(), job_id))
            }
        }
    }
}

fn parse_flags(args: &[String]) -> WorkerResult<HashMap<String, String>> {
    let mut flags = HashMap::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let name = arg
            .strip_prefix("--")
            .ok_or_else(|| WorkerError::invalid_job(format!("unexpected argument: {}", arg)))?;
        let value = iter
            .next()
            .ok_or_else(|| WorkerError::invalid_job(format!("--{} needs a value", name)))?;
        flags.insert(name.to_string(), value.clone());
    }
    Ok(flags)
}

fn required<'a>(flags: &'a HashMap<String, String>, name: &str) -> WorkerResult<&'a str> {
    flags
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| WorkerError::invalid_job(format!("missing --{}", name)))
}
