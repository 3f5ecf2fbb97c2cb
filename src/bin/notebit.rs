//! Notebit CLI - drive the indexing and retrieval core from a terminal.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

use notebit_core::rag::RagEvent;
use notebit_core::NotebitService;

#[derive(Parser)]
#[command(name = "notebit")]
#[command(about = "Index and query a local Markdown notes vault")]
struct Cli {
    /// Vault root directory
    #[arg(default_value = ".")]
    vault: PathBuf,

    /// Write logs to <vault>/data/notebit.log instead of stderr
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the vault and index every stale note
    Scan,

    /// Semantic similarity search
    Search {
        /// Search query
        query: String,
        /// Maximum results
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Ask a question over the vault (RAG, streaming)
    Ask {
        /// The question
        query: String,
    },

    /// Print the note graph as JSON
    Graph,

    /// Show index statistics
    Stats,

    /// Watch the vault and index changes until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = if cli.log_file {
        let log_dir = cli.vault.join("data");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::never(log_dir, "notebit.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    };

    let service = NotebitService::new();
    service
        .open_vault(&cli.vault)
        .await
        .with_context(|| format!("failed to open vault {}", cli.vault.display()))?;

    match cli.command {
        Command::Scan => {
            service.reindex_all().await?;
            service.wait_for_indexing().await?;
            let progress = service.get_index_progress().await?;
            println!(
                "indexed {} of {} notes ({} failed)",
                progress.done, progress.total, progress.failed
            );
        }

        Command::Search { query, limit } => {
            service.wait_for_indexing().await?;
            let results = service.find_similar(&query, limit).await?;
            if results.is_empty() {
                println!("no matches");
            }
            for hit in results {
                let heading = if hit.heading.is_empty() {
                    String::new()
                } else {
                    format!(" [#{}]", hit.heading)
                };
                println!("{:.3}  {}{}", hit.similarity, hit.path, heading);
                for line in hit.content.lines().take(2) {
                    println!("       {line}");
                }
            }
        }

        Command::Ask { query } => {
            service.wait_for_indexing().await?;
            let (_, mut events) = service.rag_query_stream("cli", &query).await?;
            while let Some(event) = events.recv().await {
                match event {
                    RagEvent::Delta { text, .. } => {
                        print!("{text}");
                        use std::io::Write;
                        std::io::stdout().flush().ok();
                    }
                    RagEvent::Done {
                        sources,
                        tokens_used,
                        ..
                    } => {
                        println!();
                        for (i, source) in sources.iter().enumerate() {
                            println!(
                                "[Source {}] {} ({:.3})",
                                i + 1,
                                source.path,
                                source.similarity
                            );
                        }
                        if let Some(tokens) = tokens_used {
                            println!("({tokens} tokens)");
                        }
                    }
                    RagEvent::Error { message, .. } => {
                        eprintln!("error: {message}");
                    }
                }
            }
        }

        Command::Graph => {
            service.wait_for_indexing().await?;
            let graph = service.get_graph_data().await?;
            println!("{}", serde_json::to_string_pretty(graph.as_ref())?);
        }

        Command::Stats => {
            let stats = service.get_database_stats().await?;
            let engine = service.get_vector_engine().await?;
            println!("files:           {}", stats.file_count);
            println!("chunks:          {}", stats.chunk_count);
            println!("embedded chunks: {}", stats.embedded_chunk_count);
            println!("vec indexed:     {}", stats.vec_indexed_count);
            println!("db size:         {} bytes", stats.db_size_bytes);
            println!(
                "engine:          {} (effective {})",
                engine.requested, engine.effective
            );
        }

        Command::Watch => {
            println!("watching {} (ctrl-c to stop)", cli.vault.display());
            tokio::signal::ctrl_c().await?;
            service.close_vault().await;
        }
    }

    Ok(())
}
