use kindred::app::{AppError, AppServices, ReadInputSnafu, WriteOutputSnafu};
use kindred::repl::Repl;
use kindred::settings::SettingsStore;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    // Logs go to stderr so they never interleave with the conversation.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "kindred exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let settings_store = SettingsStore::load();
    tracing::info!(path = %settings_store.config_path().display(), "loaded settings");
    let services = AppServices::bootstrap(settings_store.settings()).await?;
    let mut repl = Repl::new(services);

    let mut stdout = tokio::io::stdout();
    write_lines(&mut stdout, &["kindred: type /help for commands".to_string()]).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "repl-read-line",
    })? {
        let response = repl.handle_line(&line).await;
        write_lines(&mut stdout, &response.lines).await?;
        if response.quit {
            break;
        }
    }
    Ok(())
}

async fn write_lines(stdout: &mut tokio::io::Stdout, lines: &[String]) -> Result<(), AppError> {
    for line in lines {
        stdout
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context(WriteOutputSnafu {
                stage: "repl-write-line",
            })?;
    }
    stdout.flush().await.context(WriteOutputSnafu {
        stage: "repl-flush",
    })
}
