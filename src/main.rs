//! Tankobon CLI - headless driver for the manga content loader.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tankobon::config::{Config, ReaderConfig};
use tankobon::console::{Console, ConsoleSink};
use tankobon::library::{Library, Series};
use tankobon::loader::{ContentLoader, Task, TaskHandle, TaskState, UiQueue, ui_channel};
use tankobon::sources::SourceRegistry;
use tankobon::trackers::{Credentials, SessionState, TrackerRegistry};
use tankobon::{EntityCache, SeriesUpdate};
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

/// Manga reader content loader.
#[derive(Parser, Debug)]
#[command(name = "tankobon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log scheduler and plugin activity.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List content sources and trackers.
    Sources,

    /// Search a content source.
    Search { source: String, query: String },

    /// Load a page of a series and preload ahead of it.
    Read {
        source: String,
        series: String,

        /// Chapter position in the listing (1-based).
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        chapter: u32,

        /// Page to show (1-based).
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        page: u32,

        /// Write the shown page into this directory.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Preload only this many pages past the shown one.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        preload: Option<u32>,
    },

    /// Log in to a tracker and store the token in the config file.
    TrackLogin {
        tracker: String,

        /// Authorization code, for trackers using the code flow.
        #[arg(long, conflicts_with_all = ["username", "password"])]
        code: Option<String>,

        #[arg(long, requires = "password")]
        username: Option<String>,

        #[arg(long, requires = "username")]
        password: Option<String>,
    },

    /// Raise the chapters-read count of a tracked title.
    TrackUpdate {
        tracker: String,
        media_id: String,
        chapters_read: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let console = Console::new();

    let mut config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    init_logging(args.verbose || config.network.debug);

    let sources =
        Arc::new(SourceRegistry::with_defaults(&config).context("Failed to create sources")?);
    let trackers =
        Arc::new(TrackerRegistry::with_defaults(&config).context("Failed to create trackers")?);
    let (ui, queue) = ui_channel();
    let loader = ContentLoader::new(
        sources,
        trackers,
        Arc::new(EntityCache::new()),
        config.reader.clone(),
        ui,
        Handle::current(),
    );
    let mut ui = Ui {
        queue,
        sink: ConsoleSink::new(console),
    };

    match args.command {
        Command::Sources => {
            loader.trackers().verify_sessions().await;
            list_plugins(&loader, &ui.sink);
        }
        Command::Search { source, query } => {
            let handle = loader.submit(Task::Search { source, query });
            ui.run(&handle).await;
        }
        Command::Read {
            source,
            series,
            chapter,
            page,
            out,
            preload,
        } => {
            if let Some(amount) = preload {
                loader.set_reader_config(ReaderConfig {
                    restrict_preload_pages: true,
                    preload_pages_amount: amount as usize,
                });
            }
            read(
                &loader,
                &mut ui,
                &config,
                Series::new(source, &series, &series),
                chapter as usize - 1,
                page as usize - 1,
                out,
            )
            .await?;
        }
        Command::TrackLogin {
            tracker,
            code,
            username,
            password,
        } => {
            let credentials = match (code, username, password) {
                (Some(code), _, _) => Credentials::Code(code),
                (None, Some(username), Some(password)) => {
                    Credentials::Password { username, password }
                }
                _ => {
                    let url = loader
                        .trackers()
                        .get(&tracker)
                        .and_then(|t| t.authorization_url());
                    match url {
                        Some(url) => ui
                            .sink
                            .console()
                            .info(&format!("Authorize at {url} and pass the code with --code")),
                        None => ui
                            .sink
                            .console()
                            .info("Pass --username and --password to log in"),
                    }
                    return Ok(());
                }
            };

            let handle = loader.submit(Task::GenerateToken {
                tracker: tracker.clone(),
                credentials,
            });
            ui.run(&handle).await;
            if loader.trackers().state(&tracker) == SessionState::Authenticated {
                save_token(&loader, &mut config, &tracker)?;
                ui.sink.console().success("Token saved to configuration");
            }
        }
        Command::TrackUpdate {
            tracker,
            media_id,
            chapters_read,
        } => {
            loader.trackers().verify_sessions().await;
            let handle = loader.submit(Task::UpdateProgress {
                tracker,
                media_id,
                chapters_read,
            });
            ui.run(&handle).await;
        }
    }

    if ui.sink.failures > 0 {
        anyhow::bail!("{} operation(s) failed", ui.sink.failures);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tankobon=debug" } else { "tankobon=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The UI side of the CLI: owns the queue and the sink.
struct Ui {
    queue: UiQueue,
    sink: ConsoleSink,
}

impl Ui {
    /// Delivers results until `handle` finishes, then flushes the queue.
    async fn run(&mut self, handle: &TaskHandle) -> TaskState {
        loop {
            tokio::select! {
                state = handle.finished() => {
                    self.queue.drain(&mut self.sink);
                    return state;
                }
                open = self.queue.next(&mut self.sink) => {
                    if !open {
                        return handle.finished().await;
                    }
                }
            }
        }
    }
}

fn list_plugins(loader: &ContentLoader, sink: &ConsoleSink) {
    let console = sink.console();
    console.section("Content sources");
    for source in loader.sources().all() {
        println!(
            "  {} {}",
            source.name(),
            console.muted(&format!("[{}] {}", source.id(), source.domain()))
        );
    }
    console.section("Trackers");
    for tracker in loader.trackers().all() {
        println!(
            "  {} {}",
            tracker.name(),
            console.muted(&format!(
                "[{}] {:?}",
                tracker.id(),
                loader.trackers().state(tracker.id())
            ))
        );
    }
}

async fn read(
    loader: &ContentLoader,
    ui: &mut Ui,
    config: &Config,
    mut series: Series,
    chapter_index: usize,
    page: usize,
    out: Option<PathBuf>,
) -> Result<()> {
    let console = ui.sink.console();
    console.step(&format!("Reloading {}...", series.key()));
    let handle = loader.submit(Task::ReloadSeries {
        series: series.clone(),
        quick: false,
    });
    ui.run(&handle).await;

    let update = match ui.sink.series_updates.pop() {
        Some((_, SeriesUpdate::Failed(failure))) => {
            anyhow::bail!("Could not reload {}: {}", series.key(), failure)
        }
        Some((_, update)) => update,
        None => return Ok(()),
    };
    update.apply_to(&mut series);

    let chapter = series
        .chapters
        .get(chapter_index)
        .cloned()
        .with_context(|| format!("{} has no chapter {}", series.title, chapter_index + 1))?;

    ui.sink.console().step(&format!("Loading page {}...", page + 1));
    let handle = loader.submit(Task::LoadPage {
        chapter: chapter.clone(),
        page,
    });
    if ui.run(&handle).await == TaskState::Completed
        && let (Some(dir), Some((_, image))) = (out, ui.sink.pages.last())
    {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("page-{:03}", page + 1));
        std::fs::write(&path, image)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        ui.sink
            .console()
            .success(&format!("Saved {}", path.display()));
    }

    while loader.preloads_outstanding(&chapter.key()) > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    if let Some(pages) = loader.cache().chapter(&chapter.key()) {
        ui.sink.console().info(&format!(
            "{}/{} pages cached",
            pages.cached_count(),
            pages.len()
        ));
    }

    let library_path = config.library_path()?;
    let mut library = Library::load_from(&library_path)
        .with_context(|| format!("Failed to load library {}", library_path.display()))?;
    if let Some(entry) = series.chapter_mut(&chapter.id) {
        entry.current_page = page;
    }
    library.add_series(series);
    library
        .save_to(&library_path)
        .with_context(|| format!("Failed to save library {}", library_path.display()))?;
    Ok(())
}

/// Copies the tracker's new token into the config file.
fn save_token(loader: &ContentLoader, config: &mut Config, tracker_id: &str) -> Result<()> {
    let token = loader
        .trackers()
        .get(tracker_id)
        .and_then(|t| t.access_token());
    let credentials = match tracker_id {
        "kitsu" => &mut config.trackers.kitsu,
        "anilist" => &mut config.trackers.anilist,
        other => anyhow::bail!("Unknown tracker: {other}"),
    };
    credentials.access_token = token;
    config.save().context("Failed to save configuration")?;
    Ok(())
}
