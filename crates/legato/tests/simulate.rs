use legato::{cli::simulate::simulate, config::Config, job::Job};
use std::io::Write;
use tempfile::NamedTempFile;

const MAX_TICKS: u64 = 5_000_000;

fn write_file(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const CONFIG: &str = r#"
[machine.planner]
look_ahead_depth = 8
look_ahead_capacity = 16
"#;

const JOB: &str = r#"{
    "moves": [
        { "position": [20.0, 0.0, 0.0, 1.0, 0.0], "feed_rate": 40.0 },
        { "position": [20.0, 20.0, 0.0, 1.0, 0.0], "feed_rate": 40.0 },
        { "position": [0.0, 0.0, 0.0, 0.0, 0.0], "feed_rate": 40.0 }
    ]
}"#;

#[test]
fn job_files_run_to_completion() {
    let config_file = write_file(".toml", CONFIG);
    let job_file = write_file(".json", JOB);

    let config = Config::from_file(config_file.path()).unwrap();
    config.validate().unwrap();
    let job = Job::from_file(job_file.path()).unwrap();

    let summary = simulate(&config, job, MAX_TICKS, None).unwrap();
    assert_eq!((summary.queued, summary.completed), (3, 3));
    assert_eq!(summary.position[..3], [0, 0, 0]);
    assert_eq!(summary.pulses[0], 3200);
    assert_eq!(summary.pulses[1], 3200);
    assert_eq!(summary.pulses[3], 840);
    assert!(summary.seconds > 0.0);
    assert_eq!(summary.homed, [false; 3]);
    assert_eq!(summary.probe_height, None);
}

#[test]
fn pausing_midway_does_not_change_the_outcome() {
    let config = Config::from_toml(CONFIG).unwrap();
    let straight = simulate(&config, Job::from_json(JOB).unwrap(), MAX_TICKS, None).unwrap();
    let paused = simulate(&config, Job::from_json(JOB).unwrap(), MAX_TICKS, Some(2500)).unwrap();

    assert_eq!(paused.pulses, straight.pulses);
    assert_eq!(paused.position, straight.position);
    assert_eq!(paused.completed, 3);
}

#[test]
fn unfinished_job_is_an_error() {
    let config = Config::default();
    let job = Job::from_json(JOB).unwrap();
    let err = simulate(&config, job, 100, None).unwrap_err();
    assert!(err.to_string().contains("did not finish"));
}

#[test]
fn missing_job_file_is_reported() {
    let err = Job::from_file("/nonexistent/job.json").unwrap_err();
    assert!(err.to_string().contains("failed to read job file"));
}
