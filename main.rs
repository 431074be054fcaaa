use peloader::{Arena, PeFile, PeLoader, pe_import};
use std::ffi::c_char;
use std::{env, process::exit};
use tracing_subscriber::EnvFilter;

struct Opts {
    /// Whether to bind imports that have a registered provider.
    bind: bool,

    /// The image to inspect.
    image: String,
}

#[pe_import("msvcrt.dll")]
unsafe fn strlen(s: *const c_char) -> usize {
    unsafe { libc::strlen(s) }
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    let Some(opts) = parse_opts(&args) else {
        eprintln!("usage: peloader [--bind] <image>");
        exit(1);
    };

    if let Err(e) = run(&opts) {
        eprintln!("peloader: {}: {}", opts.image, e);
        exit(1);
    }
}

fn run(opts: &Opts) -> peloader::Result<()> {
    let loader = PeLoader::new()?;
    let mut file = loader.open(&opts.image)?;

    dump(&file)?;
    if opts.bind {
        let arena = Arena::new();
        let report = file.bind_registered(&arena)?;
        for bound in &report.bound {
            println!("bound {}", bound);
        }
        for unresolved in &report.unresolved {
            println!("unresolved {}", unresolved);
        }
    }

    file.close()
}

fn dump(file: &PeFile<'_>) -> peloader::Result<()> {
    let arena = Arena::new();
    for module in file.modules()? {
        println!("{}", module);
        for symbol in file.imports(&module, &arena)? {
            println!("  import {}", symbol);
        }
    }
    for symbol in file.exports(&arena)? {
        println!("export {} at {:p}", symbol, symbol.address());
    }
    Ok(())
}

fn parse_opts(args: &[String]) -> Option<Opts> {
    let mut bind = false;
    let mut image = None;
    for arg in args.get(1..).unwrap_or(&[]) {
        if arg == "--bind" {
            bind = true;
        } else if image.is_none() {
            image = Some(arg.clone());
        } else {
            return None;
        }
    }
    image.map(|image| Opts { bind, image })
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
