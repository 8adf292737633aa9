use std::time::Duration;
use tokio::process::Command;

/// Runs `command` through bash after `delay`, detached from this process.
///
/// Nothing is captured and the exit status is never looked at.
pub fn execute_detached(command: &str, delay: Duration) {
    let script = detached_script(command);

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match Command::new("bash").arg("-c").arg(&script).spawn() {
            Ok(mut child) => {
                // bash exits as soon as the job is disowned.
                if let Err(e) = child.wait().await {
                    log::warn!("Failed to wait for launcher shell: {e}");
                }
            }
            Err(e) => log::error!("Failed to execute {script:?}: {e}"),
        }
    });
}

fn detached_script(command: &str) -> String {
    format!("({command}) & disown")
}
