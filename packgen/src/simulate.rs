//! Terminal walk-through of a compiled pack, mirroring how the playback
//! device moves between nodes: choices picked by wheel index, timeout and
//! auto-advance edges followed on their own.

use std::io::{self, BufRead, Write};
use std::path::Path;

use storypack_core::{NodeId, PackError, PackNode, PackReader, Trigger};

pub fn run(pack_path: &Path, entry: Option<String>) -> storypack_core::Result<()> {
    let reader = PackReader::open(pack_path)?;
    let meta = reader.meta();
    println!(
        "{} ({}, v{}): {} nodes, {} assets",
        meta.title,
        meta.language,
        meta.version,
        reader.node_count(),
        reader.asset_count()
    );
    if !meta.description.is_empty() {
        println!("{}", meta.description);
    }
    println!();

    let mut current = starting_node(&reader, entry)?;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        describe(&current);

        let mut auto = None;
        let mut timeout = None;
        let mut choices: Vec<(u32, &NodeId)> = Vec::new();
        for transition in &current.transitions {
            match transition.trigger {
                Trigger::AutoAdvance => auto = Some(&transition.target),
                Trigger::Timeout { seconds } => timeout = Some((seconds, &transition.target)),
                Trigger::Choice { index } => choices.push((index, &transition.target)),
            }
        }
        choices.sort_by_key(|(index, _)| *index);

        let next_id = if let Some(target) = auto {
            println!("  ⏩ auto → {}", target);
            target.clone()
        } else if !choices.is_empty() {
            for (index, target) in &choices {
                println!("  [{}] {}", index, target);
            }
            match prompt_choice(&mut lines, &choices, timeout)? {
                Some(id) => id,
                None => break,
            }
        } else if let Some((seconds, target)) = timeout {
            println!("  … waits {} s → {}", seconds, target);
            target.clone()
        } else {
            println!("  ■ the end");
            break;
        };

        current = match reader.node_by_id(&next_id)? {
            Some(node) => node,
            None => {
                println!("  ⚠️ {} is not in this pack; stopping", next_id);
                break;
            }
        };
        println!();
    }
    Ok(())
}

fn starting_node(reader: &PackReader, entry: Option<String>) -> storypack_core::Result<PackNode> {
    match entry {
        Some(id) => {
            let id = NodeId::new(id);
            reader.node_by_id(&id)?.ok_or_else(|| {
                PackError::Config(format!("Entry node \"{}\" is not in this pack", id))
            })
        }
        None => {
            let ordinals = reader.entry_points();
            let first = ordinals
                .first()
                .ok_or_else(|| PackError::Config("Pack has no entry points".to_string()))?;
            Ok(reader.node(*first)?)
        }
    }
}

fn describe(node: &PackNode) {
    if node.terminal {
        println!("▶ {} (terminal)", node.id);
    } else {
        println!("▶ {}", node.id);
    }
    if let Some(hash) = &node.audio {
        println!("  ♪ narration {}", short(hash));
    }
    if let Some(hash) = &node.image {
        println!("  ▣ artwork {}", short(hash));
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn prompt_choice(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    choices: &[(u32, &NodeId)],
    timeout: Option<(u32, &NodeId)>,
) -> storypack_core::Result<Option<NodeId>> {
    loop {
        match timeout {
            Some((seconds, target)) => {
                print!(
                    "choice (number, Enter = wait {} s → {}, q = quit): ",
                    seconds, target
                );
            }
            None => print!("choice (number, q = quit): "),
        }
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => return Ok(None),
        };
        let input = line.trim();
        if input.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        if input.is_empty() {
            if let Some((_, target)) = timeout {
                return Ok(Some(target.clone()));
            }
            continue;
        }
        match input.parse::<u32>() {
            Ok(n) => {
                if let Some((_, target)) = choices.iter().find(|(index, _)| *index == n) {
                    return Ok(Some((*target).clone()));
                }
                println!("  no choice {}", n);
            }
            Err(_) => println!("  type a listed number"),
        }
    }
}
