use std::time::{Duration, Instant};

use sandbox_executor::judge::{CompileRunRequest, Verdict};

mod common;

use common::Sandbox;

const SUM: &str = "read a b\necho $((a + b))\n";

#[tokio::test]
async fn sum_program_is_accepted_for_every_input() {
    let sandbox = Sandbox::new(2).await;
    let request = CompileRunRequest::new("shell", SUM).with_inputs(["1 1", "2 2"]);

    let response = sandbox.judge.compile_and_run(&request).await.unwrap();

    assert_eq!(response.verdict, Verdict::Accepted);
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].output, "2\n");
    assert_eq!(response.results[1].output, "4\n");
    assert!(response.results.iter().all(|r| r.verdict == Verdict::Accepted));
    assert_eq!(response.executable_size, SUM.len() as u64);

    // One compile and two runs, each cleaned up
    assert_eq!(sandbox.calls("init"), 3);
    assert_eq!(sandbox.calls("cleanup"), 3);
    assert_eq!(sandbox.pool.status().available, 2);
}

#[tokio::test]
async fn sleeping_input_is_the_only_time_limit_exceeded() {
    let sandbox = Sandbox::new(2).await;
    let source = "read n\nif [ \"$n\" = sleep ]; then sleep 10; fi\necho \"$n\"\n";
    let mut request = CompileRunRequest::new("shell", source).with_inputs(["a", "sleep", "b"]);
    request.run_limits.time_ms = 300;

    let started = Instant::now();
    let response = sandbox.judge.compile_and_run(&request).await.unwrap();

    let verdicts: Vec<_> = response.results.iter().map(|r| r.verdict).collect();
    assert_eq!(
        verdicts,
        [Verdict::Accepted, Verdict::TimeLimitExceeded, Verdict::Accepted]
    );
    assert_eq!(response.verdict, Verdict::TimeLimitExceeded);
    assert_eq!(response.results[0].output, "a\n");
    assert_eq!(response.results[2].output, "b\n");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn syntax_error_is_a_compilation_error() {
    let sandbox = Sandbox::new(1).await;
    let request = CompileRunRequest::new("shell", "if then fi (\n").with_inputs(["1 2"]);

    let response = sandbox.judge.compile_and_run(&request).await.unwrap();

    assert_eq!(response.verdict, Verdict::CompilationError);
    assert!(!response.compile_output.trim().is_empty());
    assert!(response.results.is_empty());
    assert_eq!(sandbox.calls("run"), 1);
    assert_eq!(sandbox.calls("cleanup"), 1);
}

#[tokio::test]
async fn wrong_exit_and_wrong_output_are_reported() {
    let sandbox = Sandbox::new(2).await;
    let source = "read n\necho \"$n\"\n[ \"$n\" = fail ] && exit 3\nexit 0\n";
    let mut request = CompileRunRequest::new("shell", source).with_inputs(["ok", "fail", "other"]);
    request.expected_outputs = Some(vec!["ok".into(), "fail".into(), "expected".into()]);

    let response = sandbox.judge.compile_and_run(&request).await.unwrap();

    let verdicts: Vec<_> = response.results.iter().map(|r| r.verdict).collect();
    assert_eq!(
        verdicts,
        [Verdict::Accepted, Verdict::InvalidReturn, Verdict::WrongAnswer]
    );
    assert_eq!(response.results[1].exit_code, 3);
    assert_eq!(response.verdict, Verdict::InvalidReturn);
}

#[tokio::test]
async fn more_inputs_than_boxes_all_complete() {
    let sandbox = Sandbox::new(2).await;
    let inputs: Vec<String> = (1..=6).map(|n| format!("{n} {n}")).collect();
    let request = CompileRunRequest::new("shell", SUM).with_inputs(inputs);

    let response = sandbox.judge.compile_and_run(&request).await.unwrap();

    assert_eq!(response.verdict, Verdict::Accepted);
    let outputs: Vec<_> = response.results.iter().map(|r| r.output.trim()).collect();
    assert_eq!(outputs, ["2", "4", "6", "8", "10", "12"]);
    assert_eq!(sandbox.calls("cleanup"), 7);
    assert_eq!(sandbox.pool.status().available, 2);
}
