use std::thread;
use std::time::{Duration, Instant};

use pxedeploy::executor::{CommandExecutor, CommandSpec, RealCommandExecutor};
use pxedeploy::step::Cancellation;

#[test]
fn dry_run_skips_command_lookup() {
    let executor = RealCommandExecutor { dry_run: true };
    let spec = CommandSpec::new("definitely-not-a-command", Vec::new());

    let result = executor
        .execute(&spec, &Cancellation::new())
        .expect("dry run should not require command to exist");
    assert!(result.status.is_none(), "dry run result should not have an exit status");
    assert!(result.success());
}

#[test]
fn non_dry_run_fails_for_nonexistent_command() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("this-command-should-not-exist", Vec::new());

    let result = executor.execute(&spec, &Cancellation::new());

    assert!(result.is_err());
    if let Err(e) = result {
        let msg = e.to_string();
        assert!(
            msg.contains("not found in PATH"),
            "Expected 'not found in PATH' in error, got: {}",
            msg
        );
        let typed = e.downcast_ref::<pxedeploy::DeployError>();
        assert!(typed.is_some(), "Expected DeployError, got: {:#}", e);
        assert!(
            matches!(typed.unwrap(), pxedeploy::DeployError::CommandNotFound { .. }),
            "Expected CommandNotFound variant, got: {:?}",
            typed.unwrap()
        );
    }
}

#[cfg(unix)]
#[test]
fn exit_status_is_reported() {
    let executor = RealCommandExecutor { dry_run: false };

    let ok = executor
        .execute(&CommandSpec::new("true", Vec::new()), &Cancellation::new())
        .unwrap();
    assert!(ok.success());
    assert_eq!(ok.code(), Some(0));

    let failed = executor
        .execute(&CommandSpec::new("false", Vec::new()), &Cancellation::new())
        .unwrap();
    assert!(!failed.success());
    assert_eq!(failed.code(), Some(1));
}

#[cfg(unix)]
#[test]
fn output_tail_is_captured() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new(
        "sh",
        vec!["-c".to_string(), "echo hello; echo oops >&2".to_string()],
    );

    let result = executor.execute(&spec, &Cancellation::new()).unwrap();

    assert!(result.success());
    assert_eq!(result.stdout, "hello");
    assert_eq!(result.stderr, "oops");
}

#[cfg(unix)]
#[test]
fn environment_is_passed_to_the_command() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("sh", vec!["-c".to_string(), "echo $PXE_NODE".to_string()])
        .with_env("PXE_NODE", "n1");

    let result = executor.execute(&spec, &Cancellation::new()).unwrap();

    assert_eq!(result.stdout, "n1");
}

#[cfg(unix)]
#[test]
fn cancellation_kills_the_command() {
    let executor = RealCommandExecutor { dry_run: false };
    let spec = CommandSpec::new("sleep", vec!["30".to_string()]);
    let cancel = Cancellation::new();

    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let started = Instant::now();
    let result = executor.execute(&spec, &cancel).unwrap();
    canceller.join().unwrap();

    assert!(result.cancelled);
    assert!(!result.success());
    assert!(started.elapsed() < Duration::from_secs(10));
}
