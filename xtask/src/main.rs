//! Build automation tasks for the permits ETL workspace
//!
//! - `generate-cli-docs`: render the `permits-etl` command reference from its
//!   clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for permits-etl", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<permits_etl::Cli>();

    let content = format!(
        r#"# permits-etl CLI Reference

Generated from the CLI source on {}.

## Typical use

```bash
# Full run, uploading a local snapshot
permits-etl run --source data/permits.json

# Scheduler-driven run, one step at a time
RUN_ID=$(permits-etl begin | jq -r .run_id)
for step in raw staging curation indexing reporting; do
  permits-etl stage "$step" --run-id "$RUN_ID"
done

# Recovery and inspection
permits-etl rebuild-index
permits-etl report
permits-etl status
```

Every command accepts `--in-memory` to run against throwaway stores.

{}

---

*Regenerate with `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());
    Ok(())
}
