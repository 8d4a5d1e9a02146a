use std::env;
use std::io;
use std::path::PathBuf;
use std::process;

use tailmerge::error::EX_USAGE;
use tailmerge::{merge_files, Backend, MergeConfig};

const HELP_MESSAGE: &str = "\
Usage: tailmerge [--io=auto|uring|blocking] [--buffer-size=BYTES] file1 [file2]...

\"Sorts\" the files but prints the file name above each group of lines from a file, like `tail -f`.
Files are merged by sorting the next unprinted line from each file,
without reordering lines from the same file or keeping everything in RAM.
(Memory usage is linear with the number of files, not with the file sizes.)
";

fn usage_exit() -> ! {
    eprint!("{HELP_MESSAGE}");
    process::exit(EX_USAGE);
}

fn main() {
    let mut config = MergeConfig::default();
    let mut files: Vec<PathBuf> = Vec::new();

    for arg in env::args_os().skip(1) {
        if let Some(flag) = arg.to_str() {
            match flag {
                "--help" | "-h" => {
                    eprint!("{HELP_MESSAGE}");
                    process::exit(0);
                }
                "--io=auto" => {
                    config.backend = Backend::Auto;
                    continue;
                }
                "--io=uring" => {
                    config.backend = Backend::Uring;
                    continue;
                }
                "--io=blocking" | "--io=sync" => {
                    config.backend = Backend::Blocking;
                    continue;
                }
                _ if flag.starts_with("--buffer-size=") => {
                    let value = &flag["--buffer-size=".len()..];
                    match value.parse::<usize>() {
                        Ok(bytes) if bytes >= 16 => config.per_source_buffer = bytes,
                        _ => {
                            eprintln!("invalid buffer size: {value}");
                            usage_exit();
                        }
                    }
                    continue;
                }
                _ if flag.starts_with("--") => {
                    eprintln!("unknown flag: {flag}");
                    usage_exit();
                }
                _ => {}
            }
        }
        files.push(PathBuf::from(arg));
    }

    if files.is_empty() {
        usage_exit();
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(err) = merge_files(&files, &mut out, &config) {
        eprintln!("{err}");
        process::exit(err.exit_code());
    }
}
