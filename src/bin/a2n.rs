/// Interactive console for exploring nested Apple II containers

use a2nest::{
    policies, walk, Container, DiskImage, NestError, NodeChain, OpenMode,
    PartitionMap, ZipArchive,
};
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Command completer for the REPL
struct CommandCompleter {
    commands: Vec<&'static str>,
}

impl CommandCompleter {
    fn new() -> Self {
        Self {
            commands: vec![
                "add",
                "cat",
                "check",
                "close",
                "create-disk",
                "create-map",
                "create-zip",
                "exit",
                "extract",
                "help",
                "info",
                "list",
                "ls",
                "open",
                "quit",
                "rename",
                "rename-volume",
                "rm",
                "save",
                "tree",
            ],
        }
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        // Only complete the first word (command name)
        let line_to_cursor = &line[..pos];
        if line_to_cursor.contains(' ') {
            return Ok((pos, vec![]));
        }

        let prefix = line_to_cursor.to_lowercase();
        let matches: Vec<Pair> = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(&prefix))
            .map(|cmd| Pair {
                display: cmd.to_string(),
                replacement: cmd.to_string(),
            })
            .collect();

        Ok((0, matches))
    }
}

impl Hinter for CommandCompleter {
    type Hint = String;
}

impl Highlighter for CommandCompleter {}
impl Validator for CommandCompleter {}
impl Helper for CommandCompleter {}

/// Get the path to the history file
fn history_path() -> Option<std::path::PathBuf> {
    dirs::home_dir().map(|mut p| {
        p.push(".a2nest_history");
        p
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== a2nest ===");
    println!("Interactive console for exploring nested Apple II containers.");
    println!("Type 'help' for available commands\n");

    let mut rl = Editor::new().expect("Failed to create editor");
    rl.set_helper(Some(CommandCompleter::new()));

    if let Some(history_path) = history_path() {
        let _ = rl.load_history(&history_path);
    }

    let mut chain: Option<NodeChain> = None;
    let mut chain_path = String::new();

    loop {
        let readline = rl.readline("> ");
        let input = match readline {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                if let Some(history_path) = history_path() {
                    let _ = rl.save_history(&history_path);
                }
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let _ = rl.add_history_entry(input);

        let parts = parse_command_line(input);
        if parts.is_empty() {
            continue;
        }
        let command = parts[0].to_lowercase();

        match command.as_str() {
            "help" => {
                print_help();
            }
            "quit" | "exit" => {
                if let Some(history_path) = history_path() {
                    let _ = rl.save_history(&history_path);
                }
                println!("Goodbye!");
                break;
            }
            "open" => {
                if parts.len() < 2 {
                    println!("Usage: open <ext-path>");
                    continue;
                }
                match NodeChain::open_path(&parts[1], OpenMode::ReadWrite) {
                    Ok(c) => {
                        println!(
                            "Opened {} ({} level{}, leaf: {})",
                            parts[1],
                            c.depth(),
                            if c.depth() == 1 { "" } else { "s" },
                            c.leaf().kind()
                        );
                        chain = Some(c);
                        chain_path = parts[1].clone();
                    }
                    Err(e) => println!("Error: {}", e),
                }
            }
            "close" => {
                if chain.take().is_some() {
                    println!("Closed {} (unsaved changes discarded)", chain_path);
                    chain_path.clear();
                } else {
                    println!("Nothing open");
                }
            }
            "info" => match &chain {
                Some(c) => print_info(c, &chain_path),
                None => println!("No chain open (use 'open <ext-path>')"),
            },
            "ls" | "list" => match &mut chain {
                Some(c) => {
                    if let Err(e) = c.analyze_leaf() {
                        println!("Error: {}", e);
                        continue;
                    }
                    match c.leaf().container().children() {
                        Ok(children) => {
                            for child in &children {
                                println!("{:>10}  {}", child.size, child.name);
                            }
                            println!("{} item(s)", children.len());
                        }
                        Err(e) => println!("Error: {}", e),
                    }
                }
                None => println!("No chain open"),
            },
            "tree" => {
                if parts.len() < 2 {
                    println!("Usage: tree <host-file> [all|wrappers|no-archives]");
                    continue;
                }
                let policy_name = parts.get(2).map(|s| s.as_str()).unwrap_or("all");
                let policy: &a2nest::DescendPolicy = match policy_name {
                    "all" => &policies::always,
                    "wrappers" => &policies::wrappers_only,
                    "no-archives" => &policies::no_archives,
                    other => {
                        println!("Unknown policy: {}", other);
                        continue;
                    }
                };
                let result = walk(Path::new(&parts[1]), policy, &mut |entry| {
                    let kind = match entry.kind {
                        Some(kind) => kind.name(),
                        None => "file",
                    };
                    println!(
                        "{}{} [{}] {} bytes",
                        "  ".repeat(entry.depth - 1),
                        entry.name,
                        kind,
                        entry.size
                    );
                });
                if let Err(e) = result {
                    println!("Error: {}", e);
                }
            }
            "cat" => {
                if parts.len() < 2 {
                    println!("Usage: cat <member>");
                    continue;
                }
                match &mut chain {
                    Some(c) => match read_member(c, &parts[1]) {
                        Ok(data) => hex_dump(&data),
                        Err(e) => println!("Error: {}", e),
                    },
                    None => println!("No chain open"),
                }
            }
            "extract" => {
                if parts.len() < 3 {
                    println!("Usage: extract <member> <local-file>");
                    continue;
                }
                match &mut chain {
                    Some(c) => match read_member(c, &parts[1]) {
                        Ok(data) => match std::fs::write(&parts[2], &data) {
                            Ok(()) => println!("Wrote {} bytes to {}", data.len(), parts[2]),
                            Err(e) => println!("Error: {}", e),
                        },
                        Err(e) => println!("Error: {}", e),
                    },
                    None => println!("No chain open"),
                }
            }
            "add" => {
                if parts.len() < 3 {
                    println!("Usage: add <member> <local-file>");
                    continue;
                }
                match &mut chain {
                    Some(c) => {
                        let data = match std::fs::read(&parts[2]) {
                            Ok(d) => d,
                            Err(e) => {
                                println!("Error: {}", e);
                                continue;
                            }
                        };
                        match write_member(c, &parts[1], data) {
                            Ok(()) => println!("Added {} (save to persist)", parts[1]),
                            Err(e) => println!("Error: {}", e),
                        }
                    }
                    None => println!("No chain open"),
                }
            }
            "rm" => {
                if parts.len() < 2 {
                    println!("Usage: rm <member>");
                    continue;
                }
                match &mut chain {
                    Some(c) => match remove_member(c, &parts[1]) {
                        Ok(()) => println!("Removed {} (save to persist)", parts[1]),
                        Err(e) => println!("Error: {}", e),
                    },
                    None => println!("No chain open"),
                }
            }
            "rename" => {
                if parts.len() < 3 {
                    println!("Usage: rename <member> <new-name>");
                    continue;
                }
                match &mut chain {
                    Some(c) => {
                        let result = match c.leaf_mut() {
                            Container::Image(image) => image
                                .volume_mut()
                                .and_then(|v| v.rename_file(&parts[1], &parts[2])),
                            _ => Err(NestError::filesystem(
                                "rename is only supported on a mounted volume",
                            )),
                        };
                        match result {
                            Ok(()) => println!("Renamed (save to persist)"),
                            Err(e) => println!("Error: {}", e),
                        }
                    }
                    None => println!("No chain open"),
                }
            }
            "rename-volume" => {
                if parts.len() < 2 {
                    println!("Usage: rename-volume <new-name>");
                    continue;
                }
                match &mut chain {
                    Some(c) => {
                        let result = match c.leaf_mut() {
                            Container::Image(image) => image
                                .volume_mut()
                                .and_then(|v| v.rename_volume(&parts[1])),
                            _ => Err(NestError::filesystem("leaf is not a disk image")),
                        };
                        match result {
                            Ok(()) => println!("Volume renamed (save to persist)"),
                            Err(e) => println!("Error: {}", e),
                        }
                    }
                    None => println!("No chain open"),
                }
            }
            "save" => match &mut chain {
                Some(c) => match c.save_updates() {
                    Ok(()) => println!("Saved"),
                    Err(e) => println!("Error: {}", e),
                },
                None => println!("No chain open"),
            },
            "check" => match &chain {
                Some(c) => match c.check_health() {
                    Ok(()) => println!("All {} level(s) healthy", c.depth()),
                    Err(e) => println!("Error: {}", e),
                },
                None => println!("No chain open"),
            },
            "create-disk" => {
                if parts.len() < 4 {
                    println!("Usage: create-disk <path> <volume-name> <blocks>");
                    continue;
                }
                let blocks: usize = match parts[3].parse() {
                    Ok(n) => n,
                    Err(_) => {
                        println!("Bad block count: {}", parts[3]);
                        continue;
                    }
                };
                match create_disk(&parts[1], &parts[2], blocks) {
                    Ok(()) => println!("Created {} ({} blocks)", parts[1], blocks),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "create-zip" => {
                if parts.len() < 2 {
                    println!("Usage: create-zip <path>");
                    continue;
                }
                match std::fs::write(&parts[1], ZipArchive::new().to_bytes()) {
                    Ok(()) => println!("Created empty archive {}", parts[1]),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "create-map" => {
                if parts.len() < 3 {
                    println!("Usage: create-map <path> <name:blocks> [<name:blocks>...]");
                    continue;
                }
                match create_map(&parts[1], &parts[2..]) {
                    Ok(()) => println!("Created {}", parts[1]),
                    Err(e) => println!("Error: {}", e),
                }
            }
            _ => {
                println!("Unknown command: {} (try 'help')", command);
            }
        }
    }
}

/// Read one member of the leaf container
fn read_member(chain: &mut NodeChain, name: &str) -> Result<Vec<u8>, NestError> {
    chain.analyze_leaf()?;
    let segment = a2nest::Segment::Name(name.to_string());
    let leaf = chain.leaf().container();
    let child = leaf.find_child(&segment)?;
    leaf.extract_child(&child)
}

/// Write one member of the leaf container, marking the leaf dirty
fn write_member(chain: &mut NodeChain, name: &str, data: Vec<u8>) -> Result<(), NestError> {
    chain.analyze_leaf()?;
    match chain.leaf_mut() {
        Container::Archive(archive) => archive.add_record(name, data),
        Container::Image(image) => image.volume_mut()?.write_file(name, &data),
        other => Err(NestError::filesystem(format!(
            "cannot add members to a {}",
            other.kind()
        ))),
    }
}

/// Remove one member of the leaf container, marking the leaf dirty
fn remove_member(chain: &mut NodeChain, name: &str) -> Result<(), NestError> {
    chain.analyze_leaf()?;
    match chain.leaf_mut() {
        Container::Archive(archive) => archive.remove_record(name),
        Container::Image(image) => image.volume_mut()?.delete_file(name),
        other => Err(NestError::filesystem(format!(
            "cannot remove members from a {}",
            other.kind()
        ))),
    }
}

/// Create a freshly formatted disk image file
fn create_disk(path: &str, volume_name: &str, blocks: usize) -> Result<(), NestError> {
    let mut image = DiskImage::create(volume_name, blocks)?;
    std::fs::write(path, image.to_bytes())?;
    Ok(())
}

/// Create a partitioned image file from name:blocks definitions
fn create_map(path: &str, defs: &[String]) -> Result<(), NestError> {
    let mut partitions = Vec::new();
    for def in defs {
        let (name, blocks) = def
            .split_once(':')
            .ok_or_else(|| NestError::invalid_format(format!("expected name:blocks, got {}", def)))?;
        let blocks: usize = blocks
            .parse()
            .map_err(|_| NestError::invalid_format(format!("bad block count in {}", def)))?;
        partitions.push((name, blocks));
    }
    let map = PartitionMap::create(&partitions)?;
    std::fs::write(path, map.to_bytes())?;
    Ok(())
}

fn print_info(chain: &NodeChain, path: &str) {
    println!("Path: {}", path);
    println!("Depth: {} level(s)", chain.depth());
    for level in 0..chain.depth() {
        if let Some(node) = chain.node(level) {
            println!(
                "  [{}] {} - {} bytes{}",
                level,
                node.container().describe(),
                node.backing_len(),
                if node.is_dirty() { " (dirty)" } else { "" },
            );
        }
    }
    if let Container::Image(image) = chain.leaf().container() {
        if let Ok(info) = image.info() {
            println!(
                "Leaf volume: {} ({} of {} blocks free, {} file(s))",
                info.volume_name, info.free_blocks, info.total_blocks, info.file_count
            );
        }
    }
}

fn hex_dump(data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let hex: Vec<String> = row.iter().map(|b| format!("{:02X}", b)).collect();
        let text: String = row
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:06X}  {:<47}  {}", i * 16, hex.join(" "), text);
        if i >= 63 {
            println!("... ({} bytes total)", data.len());
            break;
        }
    }
}

fn parse_command_line(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(current.clone());
                    current.clear();
                }
            }
            _ => {
                current.push(ch);
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

fn print_help() {
    println!("Available commands:");
    println!("  open <ext-path>                - Open a nested path, e.g. disk.po:Archive.zip");
    println!("  close                          - Close without saving (discards changes)");
    println!("  info                           - Show the open chain, level by level");
    println!("  ls                             - List the leaf container's children");
    println!("  tree <host> [all|wrappers|no-archives] - Recursively enumerate a host file");
    println!("  cat <member>                   - Hex dump a member of the leaf");
    println!("  extract <member> <local-file>  - Copy a member out to the host filesystem");
    println!("  add <member> <local-file>      - Add/replace a member from a local file");
    println!("  rm <member>                    - Remove a member");
    println!("  rename <member> <new-name>     - Rename a file on a mounted volume");
    println!("  rename-volume <new-name>       - Rename the leaf volume itself");
    println!("  save                           - Propagate changes up and rewrite the host file");
    println!("  check                          - Verify bookkeeping at every level");
    println!("  create-disk <path> <vol> <blocks> - Create a formatted disk image");
    println!("  create-zip <path>              - Create an empty archive");
    println!("  create-map <path> <name:blocks>... - Create a partitioned image");
    println!("  help                           - Show this help");
    println!("  quit, exit                     - Exit");
}
