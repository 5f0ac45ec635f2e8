use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use disc::{Disc, Entry, Format};
use tracing_subscriber::EnvFilter;


#[derive(Parser)]
struct Cli {
    /// Path to the disc image to open.
    image: PathBuf,

    /// Preferred filesystem format; falls back per the disc's own priority order if unavailable.
    #[arg(long)]
    prefer: Option<FormatArg>,

    /// Raise the diagnostic verbosity (stacks; overridden by RUST_LOG if set).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the disc's name, publisher, application id and selected format.
    Info,
    /// List the immediate children of a directory.
    Ls(PathArgs),
    /// Stream a file's contents to stdout.
    Cat(PathArgs),
    /// Recursively walk the tree rooted at a path.
    Tree(PathArgs),
}

#[derive(Args)]
struct PathArgs {
    #[arg(default_value = "/")]
    path: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Iso9660,
    Joliet,
    Rockridge,
    Udf,
}
impl From<FormatArg> for Format {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Iso9660 => Format::Iso9660,
            FormatArg::Joliet => Format::Joliet,
            FormatArg::Rockridge => Format::RockRidge,
            FormatArg::Udf => Format::Udf,
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tracing::debug!(image = ?cli.image, "opening disc image");
    let input_file = File::open(&cli.image)
        .expect("failed to open disc image");
    let preference = cli.prefer.map(Format::from);
    let disc = disc::open(input_file, preference)
        .expect("failed to identify a compatible filesystem on this disc image");

    match cli.command {
        Command::Info => print_info(&disc),
        Command::Ls(args) => list_directory(&disc, &args.path),
        Command::Cat(args) => cat_file(&disc, &args.path),
        Command::Tree(args) => print_tree(&disc, &args.path),
    }
}

fn print_info<S: Read + std::io::Seek + 'static>(disc: &Disc<S>) {
    println!("name:        {}", disc.name());
    println!("publisher:   {}", disc.publisher());
    println!("application: {}", disc.application());
    println!("format:      {}", disc.selected_format());
}

fn list_directory<S: Read + std::io::Seek + 'static>(disc: &Disc<S>, path: &str) {
    let dir = disc.get(path)
        .expect("failed to resolve path");
    if !dir.is_dir() {
        eprintln!("{} is not a directory", path);
        std::process::exit(1);
    }
    for entry in dir.iterdir().expect("failed to list directory") {
        let entry = entry.expect("failed to read directory entry");
        print_entry_line(&entry);
    }
}

fn print_entry_line(entry: &Entry<impl Read + std::io::Seek + 'static>) {
    let kind = if entry.is_symlink() {
        'l'
    } else if entry.is_dir() {
        'd'
    } else {
        '-'
    };
    println!(
        "{}{:04o} {:>5} {:>10} {}",
        kind,
        entry.mode() & 0o7777,
        entry.uid(),
        entry.size(),
        entry.name(),
    );
}

fn cat_file<S: Read + std::io::Seek + 'static>(disc: &Disc<S>, path: &str) {
    let entry = disc.get(path)
        .expect("failed to resolve path");
    let mut stream = entry.open()
        .expect("failed to open file for reading");
    io::copy(&mut stream, &mut io::stdout())
        .expect("failed to stream file contents to stdout");
}

fn print_tree<S: Read + std::io::Seek + 'static>(disc: &Disc<S>, path: &str) {
    let root = disc.get(path)
        .expect("failed to resolve path");
    println!("{}", path);
    walk_tree(&root, 1);
}

fn walk_tree<S: Read + std::io::Seek + 'static>(entry: &Entry<S>, depth: usize) {
    if !entry.is_dir() {
        return;
    }
    let children = match entry.iterdir() {
        Ok(children) => children,
        Err(e) => {
            eprintln!("{}failed to list directory: {}", "  ".repeat(depth), e);
            return;
        }
    };
    for child in children {
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                eprintln!("{}failed to read entry: {}", "  ".repeat(depth), e);
                continue;
            }
        };
        println!("{}{}", "  ".repeat(depth), child.name());
        walk_tree(&child, depth + 1);
    }
}
