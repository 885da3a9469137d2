use std::io::Write as _;

use voxhaul_core::Configuration;

/// Ask a y/n question on the terminal; `force` answers yes without asking.
pub async fn confirm(question: impl Into<String>, force: bool) -> anyhow::Result<bool> {
    if force {
        return Ok(true);
    }
    let question = question.into();
    tokio::task::spawn_blocking(move || confirm_blocking(&question))
        .await
        .map_err(|err| anyhow::anyhow!("prompt task failed: {err}"))?
}

fn confirm_blocking(question: &str) -> anyhow::Result<bool> {
    loop {
        let answer = prompt_line(&format!("{question} (y/n): "))?;
        match answer.to_lowercase().as_str() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => println!("Enter 'y' or 'n' for 'yes' or 'no'"),
        }
    }
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    let mut out = std::io::stdout();
    out.write_all(prompt.as_bytes())?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

/// Print a summary of what a new job will upload, ahead of the create prompt.
pub fn print_estimated_job(config: &Configuration) {
    let extent = &config.ingest_job.extent;
    println!("Preparing to create a new ingest job:");
    println!(
        "  extent: x {:?}  y {:?}  z {:?}  t {:?}",
        extent.x, extent.y, extent.z, extent.t
    );
    println!(
        "  estimated upload: {} {}",
        config.estimated_task_count(),
        config.mode().units()
    );
}
