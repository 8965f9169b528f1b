use crate::values::Args;
use serde::{Deserialize, Serialize};

/// A benchmark identifier plus the arguments it runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRef {
    pub id: String,
    #[serde(default)]
    pub args: Args,
}

/// One test of an experiment. `concurrent` names the companion workload that
/// runs in the background for the whole lifetime of the measured process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub benchmark: BenchmarkRef,
    #[serde(default)]
    pub concurrent: Option<BenchmarkRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tests: Vec<TestDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_reads_optional_fields() {
        let test: TestDescriptor = serde_json::from_str(
            r#"{
                "name": "Buckets using MCS",
                "benchmark": {"id": "buckets", "args": {"lock": "mcs", "duration": 1000}}
            }"#,
        )
        .expect("descriptor");
        assert_eq!(test.label, None);
        assert!(test.concurrent.is_none());
        assert_eq!(test.benchmark.args.get_i64("duration"), Some(1000));
    }
}
