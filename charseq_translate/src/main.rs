use std::{
    io::{self, Write},
    path::Path,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use plane::ml::seq2seq::translator::CharacterTranslator;

const DEFAULT_REPLAY_COUNT: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "translate", author, version, about, long_about = None)]
struct Cli {
    /// Saved model json written by the trainer
    model_fpath: String,

    /// Translate the given phrase and exit (repeatable)
    #[arg(short = 'p', long = "phrase")]
    phrases: Vec<String>,

    /// Phrase pair file to replay, defaults to the file the model was trained on
    #[arg(short = 'i', long)]
    input_txt_path: Option<String>,

    /// Number of phrase pairs to replay from the start of the file
    #[arg(short = 'n', long)]
    count: Option<usize>,
}

fn main() -> Result<()> {
    configure_logging()?;
    let cli = Cli::parse();

    let (translator, config) = translate::load(&cli.model_fpath)?;

    if !cli.phrases.is_empty() {
        for phrase in &cli.phrases {
            println!("Input sentence:       {phrase}");
            print_translation(&translator, phrase)?;
        }
        return Ok(());
    }

    if cli.input_txt_path.is_some() || cli.count.is_some() {
        let input_txt_path = cli
            .input_txt_path
            .or(config.input_txt_path)
            .context("no phrase pair file given and none recorded in the saved model")?;
        let count = cli.count.unwrap_or(DEFAULT_REPLAY_COUNT);

        return replay_dataset(&translator, &input_txt_path, count);
    }

    run_repl(cli.model_fpath, translator)
}

fn configure_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn replay_dataset(translator: &CharacterTranslator, input_txt_path: &str, count: usize) -> Result<()> {
    let pairs = translate::read_dataset_pairs(input_txt_path, count)?;

    for pair in &pairs {
        println!();
        println!("Input sentence:       {}", pair.input);
        println!("Expected sentence:    {}", pair.target_phrase());
        print_translation(translator, &pair.input)?;
    }
    Ok(())
}

fn run_repl(mut model_fpath: String, mut translator: CharacterTranslator) -> Result<()> {
    println!("Starting... (latent_dim = {})", translator.latent_dim());
    println!("   - Commands available: [ '.load <path>' | '.reload' | '.quit' ]");

    let stdin = io::stdin();

    loop {
        println!();
        print!("Enter phrase to translate: ");
        io::stdout().flush()?;

        let Some(input_txt) = read_line(&stdin)? else {
            return Ok(());
        };

        match process_repl_commands(&input_txt, Path::new(&model_fpath)) {
            CliReplActions::ProcessInput => print_translation(&translator, &input_txt)?,
            CliReplActions::Reload(input_path) => match translate::load(&input_path) {
                Ok((next, _)) => {
                    translator = next;
                    model_fpath = input_path;
                }
                Err(e) => println!("Failed to load model: {e:#}"),
            },
            CliReplActions::Quit => return Ok(()),
            CliReplActions::Reprompt => continue,
        }
    }
}

/// Returns `None` once stdin is closed.
fn read_line(stdin: &io::Stdin) -> Result<Option<String>> {
    let mut input_txt = String::new();
    if stdin.read_line(&mut input_txt)? == 0 {
        return Ok(None);
    }
    Ok(Some(input_txt.trim().to_string()))
}

fn print_translation(translator: &CharacterTranslator, input_txt: &str) -> Result<()> {
    print!("Decoded sentence:     ");
    io::stdout().flush()?;

    let decoded_chars = match translator.translate_iter(input_txt) {
        Ok(iter) => iter,
        Err(e) => {
            println!();
            warn!("failed to translate {input_txt:?}: {e:#}");
            return Ok(());
        }
    };

    for c in decoded_chars {
        match c {
            Ok(c) => print!("{c}"),
            Err(e) => {
                println!();
                warn!("decoding stopped early: {e:#}");
                return Ok(());
            }
        }
        io::stdout().flush()?;
    }

    println!();
    Ok(())
}

#[derive(Debug, PartialEq)]
enum CliReplActions {
    ProcessInput,
    Reload(String),
    Quit,
    Reprompt,
}

fn process_repl_commands(input_txt: &str, model_fpath: &Path) -> CliReplActions {
    if input_txt.is_empty() {
        return CliReplActions::Reprompt;
    }

    if input_txt == ".quit" {
        return CliReplActions::Quit;
    }

    if input_txt.starts_with(".load") {
        let input_tokens = input_txt.split_ascii_whitespace().collect::<Vec<_>>();
        if let [".load", input_path] = input_tokens[..] {
            return CliReplActions::Reload(input_path.to_string());
        }
        println!("Command usage: .load <MODEL_FILE_PATH>");
        return CliReplActions::Reprompt;
    }

    if input_txt == ".reload" {
        match translate::latest_model_in_dir(model_fpath) {
            Ok(Some(latest_model_fpath)) if latest_model_fpath != model_fpath => {
                return CliReplActions::Reload(latest_model_fpath.to_string_lossy().to_string());
            }
            Ok(_) => println!("No newer model found in model directory"),
            Err(e) => println!("Failed to search model directory: {e:#}"),
        }
        return CliReplActions::Reprompt;
    }

    CliReplActions::ProcessInput
}
