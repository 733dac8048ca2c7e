use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Reorganize PostgreSQL tables online, without holding long exclusive locks", long_about = None)]
pub struct Args {
    /// Database to reorganize (defaults to the dbname of --uri)
    #[arg(env = "PGDATABASE")]
    pub dbname: Option<String>,

    /// PostgreSQL connection URI or key=value connection string
    #[arg(short, long, env = "PGREORG_URI", default_value = "host=localhost")]
    pub uri: String,

    /// Reorganize all databases
    #[arg(short, long)]
    pub all: bool,

    /// Reorganize specific table only (repeatable)
    #[arg(short, long = "table", value_name = "TABLE")]
    pub tables: Vec<String>,

    /// Do VACUUM FULL instead of CLUSTER
    #[arg(short, long)]
    pub no_order: bool,

    /// Order by columns instead of the cluster key
    #[arg(short, long, value_name = "COLUMNS")]
    pub order_by: Option<String>,

    /// Seconds to wait before cancelling, then terminating, conflicting backends
    #[arg(short = 'T', long, value_name = "SECS", default_value_t = 60)]
    pub wait_timeout: u64,

    /// Don't analyze at end
    #[arg(short = 'Z', long)]
    pub no_analyze: bool,

    /// Build indexes with this many parallel worker sessions
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,

    /// Print what would have been reorganized, without doing it
    #[arg(long)]
    pub dry_run: bool,

    /// Show per-statement debug output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}
