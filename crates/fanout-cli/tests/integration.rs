use std::process::Output;

use anyhow::{ensure, Context, Result};
use assert_cmd::Command;

fn fanout() -> Command {
    Command::cargo_bin("fanout").expect("fanout binary should be built")
}

fn run(args: &[&str]) -> Result<Output> {
    let output = fanout()
        .args(args)
        .output()
        .context("failed to run fanout")?;
    Ok(output)
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn replays_output_in_argument_order() -> Result<()> {
    let output = run(&["-P", "3", "echo", "{}", ":::", "a", "b", "c"])?;
    ensure!(output.status.success(), "exit: {:?}", output.status);
    ensure!(stdout_of(&output) == "a\nb\nc\n", "got {:?}", stdout_of(&output));
    Ok(())
}

#[test]
fn completion_order_does_not_change_presentation_order() -> Result<()> {
    // The first child sleeps longest; output must still lead with it.
    let output = run(&[
        "-P",
        "3",
        "sh",
        "-c",
        "sleep 0.$0; echo $0",
        ":::",
        "3",
        "1",
        "2",
    ])?;
    ensure!(output.status.success(), "exit: {:?}", output.status);
    ensure!(stdout_of(&output) == "3\n1\n2\n", "got {:?}", stdout_of(&output));
    Ok(())
}

#[test]
fn template_substitutes_inside_tokens() -> Result<()> {
    let output = run(&["echo", "pre{}post", ":::", "a"])?;
    ensure!(output.status.success());
    ensure!(stdout_of(&output) == "preapost\n", "got {:?}", stdout_of(&output));
    Ok(())
}

#[test]
fn custom_replacement_token() -> Result<()> {
    let output = run(&["-I", "@", "echo", "@@", ":::", "z"])?;
    ensure!(output.status.success());
    ensure!(stdout_of(&output) == "zz\n", "got {:?}", stdout_of(&output));
    Ok(())
}

#[test]
fn reads_arguments_from_stdin() -> Result<()> {
    let output = fanout()
        .args(["-s", "echo"])
        .write_stdin("x\ny\n\nz\n")
        .output()
        .context("run")?;
    ensure!(output.status.success());
    // Blank lines are skipped.
    ensure!(stdout_of(&output) == "x\ny\nz\n", "got {:?}", stdout_of(&output));
    Ok(())
}

#[test]
fn stderr_goes_to_stderr() -> Result<()> {
    let output = run(&["sh", "-c", "echo out; echo err 1>&2", ":::", "x"])?;
    ensure!(output.status.success());
    ensure!(stdout_of(&output) == "out\n", "stdout: {:?}", stdout_of(&output));
    ensure!(stderr_of(&output) == "err\n", "stderr: {:?}", stderr_of(&output));
    Ok(())
}

#[test]
fn exit_codes_aggregate_to_the_maximum() -> Result<()> {
    let output = run(&[
        "--keep-going-on-error",
        "sh",
        "-c",
        "exit $0",
        ":::",
        "3",
        "1",
        "2",
    ])?;
    ensure!(output.status.code() == Some(3), "exit: {:?}", output.status);
    Ok(())
}

#[test]
fn first_failure_stops_the_run() -> Result<()> {
    let output = run(&["-P", "2", "sh", "-c", "exit $0", ":::", "0", "1", "0"])?;
    ensure!(output.status.code() == Some(1), "exit: {:?}", output.status);
    Ok(())
}

#[test]
fn a_failure_terminates_children_already_running() -> Result<()> {
    // The sleeping child must be SIGTERMed and reaped, not waited out.
    let started = std::time::Instant::now();
    let output = run(&[
        "-P",
        "2",
        "sh",
        "-c",
        "if [ $0 = fail ]; then exit 1; else sleep 30; fi",
        ":::",
        "fail",
        "slow",
    ])?;
    ensure!(output.status.code() == Some(1), "exit: {:?}", output.status);
    ensure!(
        started.elapsed() < std::time::Duration::from_secs(10),
        "run took {:?}",
        started.elapsed()
    );
    Ok(())
}

#[test]
fn silent_children_produce_no_output() -> Result<()> {
    let output = run(&["true", ":::", "a", "b"])?;
    ensure!(output.status.success());
    ensure!(output.stdout.is_empty());
    ensure!(output.stderr.is_empty());
    Ok(())
}

#[test]
fn verbose_echoes_each_command() -> Result<()> {
    let output = run(&["-v", "echo", "{}", ":::", "hi", "ho"])?;
    ensure!(output.status.success());
    let stderr = stderr_of(&output);
    ensure!(stderr.contains("+ echo hi"), "stderr: {stderr:?}");
    ensure!(stderr.contains("+ echo ho"), "stderr: {stderr:?}");
    Ok(())
}

#[test]
fn zero_memory_budget_still_completes_byte_exact() -> Result<()> {
    let output = run(&[
        "--max-mem",
        "0%",
        "-P",
        "3",
        "sh",
        "-c",
        "head -c 30000 /dev/zero",
        ":::",
        "a",
        "b",
        "c",
    ])?;
    ensure!(output.status.success(), "exit: {:?}", output.status);
    ensure!(
        output.stdout.len() == 90_000,
        "got {} bytes",
        output.stdout.len()
    );
    ensure!(output.stdout.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn nested_invocations_share_the_limiter_and_keep_order() -> Result<()> {
    // Each outer child is itself a fanout run; the nested runs all draw from
    // the root invocation's budget through the limiter socket.
    let inner = format!("{} -P 2 echo ::: x y", env!("CARGO_BIN_EXE_fanout"));
    let output = run(&["-P", "2", "sh", "-c", &inner, ":::", "1", "2", "3"])?;
    ensure!(output.status.success(), "exit: {:?}", output.status);
    ensure!(
        stdout_of(&output) == "x\ny\nx\ny\nx\ny\n",
        "got {:?}",
        stdout_of(&output)
    );
    Ok(())
}

#[test]
fn missing_argument_source_is_an_error() -> Result<()> {
    let output = run(&["echo", "a"])?;
    ensure!(!output.status.success());
    ensure!(stderr_of(&output).contains(":::"), "stderr: {:?}", stderr_of(&output));
    Ok(())
}

#[test]
fn version_banner_names_the_tool() -> Result<()> {
    let output = run(&["--version"])?;
    ensure!(output.status.success());
    ensure!(stdout_of(&output).contains("fanout"));
    Ok(())
}
