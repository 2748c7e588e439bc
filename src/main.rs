use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use calnotes::api::{APIClient, NotePersister};
use calnotes::autosave::{FlushFailure, Synchronizer};
use calnotes::calendar::{self, Agenda};
use calnotes::config::{self, AppConfig, AutosaveConfig};
use calnotes::edit::{self, EditCommand, Input};
use calnotes::logger;
use calnotes::models::{NewNote, Note, RegisterRequest};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with email and password
    Login,
    /// Create an account and log in
    Register,
    /// End the current session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// List all notes
    Notes,
    /// Show notes by day for a month
    Agenda {
        /// Month as YYYY-MM (defaults to the current month)
        #[arg(long)]
        month: Option<String>,
        /// Only today's notes
        #[arg(long, conflicts_with = "month")]
        today: bool,
    },
    /// Create a note
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        /// When the note is for, e.g. 2024-05-01T10:30
        #[arg(long)]
        date: String,
    },
    /// Edit a note; changes are saved automatically after a quiet period
    Edit { id: i64 },
    /// Delete a note
    Delete { id: i64 },
    /// Show configuration or change the server URL
    Config {
        #[arg(long)]
        api_url: Option<String>,
    },
}

fn print_note(note: &Note) {
    let when = calendar::parse_note_date(&note.note_date)
        .map(|at| calendar::format_note_date(&at))
        .unwrap_or_else(|| note.note_date.clone());
    println!("#{:<5} {}  ({})", note.id, note.title, when);
    if !note.content.is_empty() {
        println!("       {}", note.content);
    }
}

async fn require_login(client: &APIClient) -> Result<()> {
    if client.current_user().await?.is_none() {
        bail!("Not logged in. Run `calnotes login` first.");
    }
    Ok(())
}

async fn handle_login(client: &APIClient) -> Result<()> {
    if let Some(user) = client.current_user().await? {
        println!("Already logged in as: {} <{}>", user.name, user.email);
        return Ok(());
    }

    let email = inquire::Text::new("Email:").prompt()?;
    let password = inquire::Password::new("Password:")
        .without_confirmation()
        .prompt()?;
    let user = client.login(&email, &password).await?;
    println!("Logged in as: {} <{}>", user.name, user.email);
    Ok(())
}

async fn handle_register(client: &APIClient) -> Result<()> {
    let name = inquire::Text::new("Name:").prompt()?;
    let email = inquire::Text::new("Email:").prompt()?;
    let password = inquire::Password::new("Password:")
        .with_custom_confirmation_message("Confirm Password:")
        .prompt()?;

    let request = RegisterRequest {
        name,
        email,
        password_confirmation: password.clone(),
        password,
    };
    let user = client.register(&request).await?;
    println!("Account created. Logged in as: {} <{}>", user.name, user.email);
    Ok(())
}

async fn handle_agenda(client: &APIClient, month: Option<String>, today: bool) -> Result<()> {
    let (year, month) = match month {
        Some(raw) => calendar::parse_month(&raw)
            .with_context(|| format!("Invalid month {:?}, expected YYYY-MM", raw))?,
        None => {
            let today = Local::now().date_naive();
            (today.year(), today.month())
        }
    };

    let notes = client.list_notes().await?;
    let agenda = Agenda::from_notes(&notes);
    if agenda.is_empty() {
        println!("No notes yet.");
        return Ok(());
    }

    if today {
        let date = Local::now().date_naive();
        let entries = agenda.day(date);
        if entries.is_empty() {
            println!("Nothing on {}.", date.format("%A, %B %-d"));
        }
        for entry in entries {
            println!("  {}  {}", entry.at.format("%-I:%M %p"), entry.note.title);
        }
        return Ok(());
    }

    let days = agenda.month(year, month);
    if days.is_empty() {
        println!("No notes in {}-{:02}.", year, month);
    }
    for (date, entries) in days {
        println!("{}", date.format("%A, %B %-d"));
        for entry in entries {
            println!("  {}  {}", entry.at.format("%-I:%M %p"), entry.note.title);
        }
    }
    if !agenda.undated().is_empty() {
        println!("Undated:");
        for note in agenda.undated() {
            println!("  #{} {} ({})", note.id, note.title, note.note_date);
        }
    }
    Ok(())
}

async fn handle_add(client: &APIClient, title: String, content: String, date: String) -> Result<()> {
    if calendar::parse_note_date(&date).is_none() {
        bail!("Unrecognised date {:?}, expected e.g. 2024-05-01T10:30", date);
    }
    let note = client
        .create_note(&NewNote {
            title,
            content,
            note_date: date,
        })
        .await?;
    print_note(&note);
    Ok(())
}

/// Interactive editor: each `field: value` line is handed to the autosave
/// synchronizer; failures are printed without interrupting input.
async fn handle_edit(client: Arc<APIClient>, autosave: &AutosaveConfig, id: i64) -> Result<()> {
    require_login(&client).await?;
    let notes = client.list_notes().await?;
    let Some(note) = notes.iter().find(|n| n.id == id) else {
        bail!("Note #{} not found", id);
    };
    print_note(note);
    println!("{}", edit::HELP);

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<String>();
    let persister = Arc::new(NotePersister::new(Arc::clone(&client)));
    let sync = Synchronizer::<i64, String>::builder(persister)
        .config(autosave.debounce_config())
        .on_error(move |failure: FlushFailure<i64, String>| {
            let _ = status_tx.send(format!("Could not save {}: {:#}", failure.key.field, failure.error));
        })
        .build();
    let quiet_secs = sync.config().quiet_period.as_secs_f32();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match edit::read_input(line) {
                    Input::Closed | Input::Command(EditCommand::Quit) => break,
                    Input::Unreadable(e) => {
                        tracing::warn!(error = %e, "stdin unreadable, ending edit session");
                        eprintln!("  ! Stopped reading input: {}", e);
                        break;
                    }
                    Input::Blank => continue,
                    Input::Invalid(msg) => eprintln!("  {}", msg),
                    Input::Command(EditCommand::Set { field, value }) => {
                        match sync.notify_edit(id, &field, value) {
                            Ok(()) => println!("  {} will save in {:.1}s", field, quiet_secs),
                            Err(e) => eprintln!("  {}", e),
                        }
                    }
                    Input::Command(EditCommand::Flush) => {
                        let summary = sync.flush_all().await;
                        println!("  saved {} field(s)", summary.persisted);
                    }
                    Input::Command(EditCommand::Delete) => {
                        let discarded = sync.cancel_entity(&id);
                        sync.shutdown();
                        sync.wait_idle().await;
                        client.delete_note(id).await?;
                        println!("Deleted note #{} ({} unsaved edit(s) discarded).", id, discarded);
                        return Ok(());
                    }
                    Input::Command(EditCommand::Help) => println!("{}", edit::HELP),
                }
            }
            Some(message) = status_rx.recv() => {
                eprintln!("  ! {}", message);
            }
        }
    }

    // Also waits for saves whose timer already fired.
    let summary = sync.flush_all().await;
    sync.shutdown();
    sync.wait_idle().await;
    drop(sync);
    while let Ok(message) = status_rx.try_recv() {
        eprintln!("  ! {}", message);
    }
    if summary.persisted > 0 {
        println!("Saved {} pending field(s).", summary.persisted);
    }
    Ok(())
}

fn handle_config(app_config: &AppConfig, api_url: Option<String>) -> Result<()> {
    if let Some(url) = api_url {
        config::set_api_base_url(&url)?;
        println!("Server URL set to {}", url);
        return Ok(());
    }
    println!("Config file: {}", config::config_path().display());
    println!("Server:      {}", app_config.general.api_base_url());
    println!(
        "Autosave:    {} ms quiet period, in-flight saves {} on teardown",
        app_config.autosave.debounce_ms,
        if app_config.autosave.abort_in_flight_on_teardown {
            "aborted"
        } else {
            "completed"
        }
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logger::init() {
        eprintln!("Warning: logging disabled: {:#}", e);
    }
    tracing::info!("calnotes {} starting", config::APP_VERSION);

    let args = Args::parse();
    let app_config = config::load_config();
    let client = Arc::new(APIClient::from_config(&app_config.general)?);

    match args.command {
        Commands::Login => handle_login(&client).await,
        Commands::Register => handle_register(&client).await,
        Commands::Logout => {
            client.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        Commands::Whoami => {
            match client.current_user().await? {
                Some(user) => println!("{} <{}>", user.name, user.email),
                None => println!("Not logged in."),
            }
            Ok(())
        }
        Commands::Notes => {
            let notes = client.list_notes().await?;
            if notes.is_empty() {
                println!("No notes yet.");
            }
            for note in &notes {
                print_note(note);
            }
            Ok(())
        }
        Commands::Agenda { month, today } => handle_agenda(&client, month, today).await,
        Commands::Add {
            title,
            content,
            date,
        } => handle_add(&client, title, content, date).await,
        Commands::Edit { id } => handle_edit(Arc::clone(&client), &app_config.autosave, id).await,
        Commands::Delete { id } => {
            client.delete_note(id).await?;
            println!("Deleted note #{}.", id);
            Ok(())
        }
        Commands::Config { api_url } => handle_config(&app_config, api_url),
    }
}
