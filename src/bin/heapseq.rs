//! Command-line driver for the byte-slice heap.
//!
//! `heapseq <capacity> seq1 [seq2 ...]` interprets each sequence (`,` pushes
//! the preceding bytes, `-` pops one, leftovers are pushed and everything is
//! drained at the end) and prints every pop as `NN: key`.
//!
//! `heapseq assert <input> [keys [values [max]]]` runs one sequence and
//! compares the joined pop keys, pop values, and highest insertion number
//! against the expected strings; mismatches report both sides and fail.

use std::env;
use std::process;

use tailmerge::error::EX_USAGE;
use tailmerge::heap::{run_sequence, LineHeap, SequenceLog};

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} <heap capacity> string1,string2-,string3,... ...");
    eprintln!("       {program} assert input [expected_keys [expected_values [expected_max]]]");
    eprintln!("',' pushes the preceding characters, '-' pops one,");
    eprintln!("at the end of each argument, all entries are popped.");
    process::exit(EX_USAGE);
}

fn parse_capacity(arg: &str, program: &str) -> usize {
    match arg.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            eprintln!("heap capacity must be a positive whole number.");
            usage(program);
        }
    }
}

fn run_assert(args: &[String], program: &str) -> ! {
    if args.is_empty() || args.len() > 4 {
        usage(program);
    }
    let input = &args[0];
    let expected_keys = args.get(1).filter(|s| !s.is_empty());
    let expected_values = args.get(2).filter(|s| !s.is_empty());
    let expected_max = args.get(3).map(|s| parse_capacity(s, program) as u64);

    print!("Testing {input} ");
    let mut heap = LineHeap::with_capacity(input.len().max(1));
    let mut log = SequenceLog::default();
    let max = run_sequence(&mut heap, input.as_bytes(), &mut log);

    let keys = log.keys_joined();
    let values = log.values_joined();
    if let Some(expected) = expected_keys {
        if keys.as_str() != expected.as_str() {
            println!("FAILED");
            println!("Expected keys   {expected}");
            println!(" but got keys   {keys}");
            println!("     and values {values} (highest: {max})");
            process::exit(1);
        }
    }
    if let Some(expected) = expected_values {
        if values.as_str() != expected.as_str() {
            println!("FAILED");
            println!("Expected values {expected}");
            println!(" but got values {values} (highest: {max})");
            println!("     and keys   {keys}");
            process::exit(1);
        }
    }
    if let Some(expected) = expected_max {
        if expected != max {
            println!("FAILED");
            println!("Expected max value {expected} but got {max}");
            println!("from values {values}");
            println!("  and keys  {keys}");
            process::exit(1);
        }
    }
    println!("PASSED");
    process::exit(0);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args
        .first()
        .map(String::as_str)
        .unwrap_or("heapseq")
        .to_string();
    if args.len() < 2 {
        usage(&program);
    }

    if args[1] == "assert" {
        run_assert(&args[2..], &program);
    }

    let capacity = parse_capacity(&args[1], &program);
    for input in &args[2..] {
        let mut heap = LineHeap::with_capacity(capacity);
        let mut log = SequenceLog::default();
        run_sequence(&mut heap, input.as_bytes(), &mut log);
        for (key, value) in log.keys.iter().zip(&log.values) {
            println!("{value:02}: {}", String::from_utf8_lossy(key));
        }
    }
}
