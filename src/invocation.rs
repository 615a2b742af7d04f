use crate::background_job::BackgroundJob;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serializable descriptor of a unit of work: which registered job type to
/// run, and the payload to materialize it from.
///
/// This is what ends up in the `data` column of a job row. The scheduler core
/// never interprets it beyond deserializing this envelope; the payload schema
/// belongs entirely to the job type, and materializing the target is the
/// payload deserialization itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// Registered name of the job type, used for registry dispatch.
    pub job_type: String,
    /// Serialized job instance.
    #[serde(default)]
    pub payload: Value,
}

impl Invocation {
    /// Capture a job instance as a storable descriptor.
    pub fn of<J: BackgroundJob>(job: &J) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_type: J::JOB_NAME.to_owned(),
            payload: serde_json::to_value(job)?,
        })
    }

    /// Read a descriptor back out of a stored job row.
    pub(crate) fn from_data(data: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct PingJob {
        target: String,
    }

    impl BackgroundJob for PingJob {
        const JOB_NAME: &'static str = "ping";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn captures_job_name_and_payload() {
        let job = PingJob {
            target: "db".to_owned(),
        };
        let invocation = Invocation::of(&job).unwrap();
        assert_eq!(invocation.job_type, "ping");
        assert_eq!(invocation.payload["target"], "db");
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let invocation =
            Invocation::from_data(&serde_json::json!({ "job_type": "ping" })).unwrap();
        assert_eq!(invocation.job_type, "ping");
        assert!(invocation.payload.is_null());
    }
}
