use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn collector_prints_only_lines_at_or_above_threshold() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("log-collector");

    let (mut collector, mut collector_stdout) = spawn_collector(&binary, "warn").await?;
    let port = read_collector_port(&mut collector_stdout).await?;
    let server = format!("127.0.0.1:{port}");

    emit(&binary, &server, "debug", "starting up").await?;
    emit(&binary, &server, "error", "disk full").await?;

    let mut seen = Vec::new();
    loop {
        let line = read_line_expect(&mut collector_stdout, "waiting for error line").await?;
        if line.ends_with("error: disk full") {
            break;
        }
        seen.push(line);
    }
    assert!(
        seen.iter().all(|line| !line.contains("starting up")),
        "debug line leaked through the filter: {seen:?}"
    );

    let _ = collector.kill().await;
    let _ = collector.wait().await;
    Ok(())
}

#[tokio::test]
async fn emitter_rejects_unknown_severity() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("log-collector");
    let status = Command::new(&binary)
        .args(["emit", "--server", "127.0.0.1:9", "--severity", "loud"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("failed to run emitter")?;
    assert!(!status.success());
    Ok(())
}

async fn spawn_collector(binary: &Path, severity: &str) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("collect")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--severity")
        .arg(severity)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn collector")?;
    let stdout = child
        .stdout
        .take()
        .context("collector stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_collector_port(reader: &mut BufReader<ChildStdout>) -> Result<u16> {
    loop {
        let line = read_line_expect(reader, "waiting for collector banner").await?;
        if !line.contains("collector listening on") {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected collector banner format")?;
        let (_, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("collector banner missing socket: {line}"))?;
        return port.parse().context("collector banner port is not a number");
    }
}

async fn emit(binary: &Path, server: &str, severity: &str, line: &str) -> Result<()> {
    let mut child = Command::new(binary)
        .args(["emit", "--server", server, "--severity", severity])
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {severity} emitter"))?;

    let mut stdin = child.stdin.take().context("emitter stdin missing")?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    drop(stdin);

    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("{severity} emitter did not exit"))??;
    if !status.success() {
        return Err(anyhow!("{severity} emitter exited with status {status}"));
    }
    Ok(())
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{description}: timed out"))??;
    if read == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
