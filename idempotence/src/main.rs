mod action;
mod application;
mod apply;
mod dump_state;
mod interrupt;
mod logging;
mod manifest;
mod options;

use anyhow::Result;
use application::handle_result;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Apply(subargs) => with_logging(&args.options, |interrupt_state| {
            application::runtime()?.block_on(apply::apply(
                &interrupt_state,
                &args.options,
                subargs,
            ))
        }),
        Commands::DumpState => {
            let state = dump_state::dump_state(&args.options.engine_config())?;
            println!("{}", state);
            Ok(())
        }
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "idempotence", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Set up logging and the interrupt handler around a command that does work.
fn with_logging<T>(
    options: &Options,
    f: impl FnOnce(interrupt::InterruptState) -> Result<T>,
) -> Result<T> {
    let mut logging = logging::set_up(&logging::Options {
        verbose: options.verbose,
        color: options.use_color(),
    })?;
    let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
    let r = f(interrupt_state);
    logging.tear_down()?;
    r
}

/// Run non-idempotent operations only when their properties changed
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the operations of a manifest whose properties changed since they were last applied
    #[command()]
    Apply(apply::Args),

    /// Print the persisted states as JSON
    DumpState,

    /// Generate markdown documentation for idempotence
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for idempotence
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for idempotence
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
