use clap::Parser as ClapParser;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process,
};

use rubyc::{CompileError, CompileOptions, DumpMode, Session, SourceUnit};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Main program
    #[arg(help = "The source file to compile")]
    file: PathBuf,

    /// Write the assembly here instead of stdout
    #[arg(short, long, help = "Output file")]
    output: Option<PathBuf>,

    /// Files compiled before the main program, in order
    #[arg(long, help = "Prelude file (repeatable)")]
    prelude: Vec<PathBuf>,

    #[arg(long, help = "Print the token stream and stop")]
    dump_tokens: bool,

    #[arg(long, help = "Print the parsed syntax tree and stop")]
    dump_ast: bool,

    #[arg(long, help = "Print the lifted functions and stop")]
    dump_transformed: bool,

    #[arg(long, help = "Disable constant folding")]
    no_fold: bool,

    #[arg(short, long, help = "Log each compiler pass")]
    verbose: bool,
}

impl Cli {
    fn options(&self) -> CompileOptions {
        let dump = if self.dump_tokens {
            Some(DumpMode::Tokens)
        } else if self.dump_ast {
            Some(DumpMode::Ast)
        } else if self.dump_transformed {
            Some(DumpMode::Transformed)
        } else {
            None
        };
        CompileOptions {
            fold: !self.no_fold,
            dump,
        }
    }
}

fn read_unit(path: &Path) -> Result<SourceUnit, CompileError> {
    let source = fs::read_to_string(path)
        .map_err(|e| CompileError::io(format!("cannot read '{}': {e}", path.display())))?;
    Ok(SourceUnit::new(path.display().to_string(), source))
}

fn run(cli: &Cli) -> Result<(), CompileError> {
    let mut units = Vec::with_capacity(cli.prelude.len() + 1);
    for path in cli.prelude.iter().chain(std::iter::once(&cli.file)) {
        units.push(read_unit(path)?);
    }

    let mut session = Session::new(cli.options());
    let text = session.compile(&units)?;
    log::info!("compiled {} unit(s)", units.len());

    match &cli.output {
        Some(path) => fs::write(path, text)
            .map_err(|e| CompileError::io(format!("cannot write '{}': {e}", path.display()))),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(err) = run(&cli) {
        eprintln!("{err}");
        process::exit(1);
    }
}
