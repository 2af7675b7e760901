use hfa_engine::{EntryId, HfaFile};
use std::env;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <path-to-hfa-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];

    println!("Reading HFA container: {}", path);
    println!("{}", "=".repeat(60));

    match HfaFile::open(path) {
        Ok(file) => {
            println!("\nContainer Information:");
            println!("  Version: {}", file.version());
            println!("  Dictionary types: {}", file.dictionary().len());

            println!("\nType Dictionary:");
            for ty in file.dictionary().iter() {
                match ty.fixed_size() {
                    Some(size) => println!("  {} ({} bytes)", ty.name, size),
                    None => println!("  {} (data-dependent size)", ty.name),
                }
            }

            println!("\nEntry Tree:");
            if let Err(e) = dump_tree(&file, file.root(), 1) {
                eprintln!("\nERROR: Failed while walking the entry tree");
                eprintln!("  {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("\nERROR: Failed to read HFA container");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

fn dump_tree(file: &HfaFile, entry: EntryId, depth: usize) -> hfa_engine::Result<()> {
    let mut at = Some(entry);
    while let Some(id) = at {
        println!(
            "{}{} <{}> ({} data bytes)",
            "  ".repeat(depth),
            file.entry_name(id),
            file.entry_type_name(id),
            file.entry_data_size(id)
        );
        if let Some(child) = file.child(id)? {
            dump_tree(file, child, depth + 1)?;
        }
        at = file.next(id)?;
    }
    Ok(())
}
