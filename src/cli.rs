use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "pagewatch",
    about = "A declarative web page monitor",
    long_about = "Monitors web pages and JSON endpoints for change: loads each watch,\n\
                  runs its scripted interaction, extracts structured data, compares it\n\
                  against the previous snapshot, and sends notifications."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run continuously with the internal scheduler (the default)
    Daemon,

    /// Check every enabled watch once and exit (for external schedulers)
    Run,

    /// Run one watch now and show the outcome without notifying
    Test {
        /// Watch id or name
        watch: String,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load all watch documents and report validation errors
    Validate,

    /// List configured watches
    List,
}
