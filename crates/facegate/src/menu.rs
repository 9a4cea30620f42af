//! Interactive menu, shown when no subcommand is given.

use crate::app::App;
use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Register,
    Run,
    Stats,
    Users,
    Exit,
}

fn parse_choice(input: &str) -> Option<Choice> {
    match input.trim() {
        "1" => Some(Choice::Register),
        "2" => Some(Choice::Run),
        "3" => Some(Choice::Stats),
        "4" => Some(Choice::Users),
        "5" | "q" | "exit" => Some(Choice::Exit),
        _ => None,
    }
}

/// Read one trimmed line; `None` on end of input.
fn prompt(label: &str) -> io::Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

pub fn run(app: &App) -> Result<()> {
    loop {
        println!();
        println!("=== facegate ===");
        println!("1. Register identity");
        println!("2. Start access control");
        println!("3. Show statistics");
        println!("4. List identities");
        println!("5. Exit");

        let Some(input) = prompt("Choice: ")? else {
            return Ok(());
        };
        let Some(choice) = parse_choice(&input) else {
            println!("Unknown option '{input}'.");
            continue;
        };

        // A failed operation is reported and the menu carries on.
        let outcome = match choice {
            Choice::Register => register(app),
            Choice::Run => app.run(),
            Choice::Stats => app.stats(false),
            Choice::Users => app.users(false),
            Choice::Exit => return Ok(()),
        };
        if let Err(err) = outcome {
            tracing::debug!(error = ?err, ?choice, "menu operation failed");
            println!("Error: {err:#}");
        }
    }
}

fn register(app: &App) -> Result<()> {
    let Some(name) = prompt("Name: ")? else {
        return Ok(());
    };
    let email = prompt("Email (optional): ")?.filter(|e| !e.is_empty());
    let photo = prompt("Photo path (leave empty to use the camera): ")?
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let registered = app.register(&name, email.as_deref(), photo.as_deref())?;
    println!("Registered '{}' with id {}.", registered.name, registered.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1\n"), Some(Choice::Register));
        assert_eq!(parse_choice(" 2 "), Some(Choice::Run));
        assert_eq!(parse_choice("3"), Some(Choice::Stats));
        assert_eq!(parse_choice("4"), Some(Choice::Users));
        assert_eq!(parse_choice("5"), Some(Choice::Exit));
        assert_eq!(parse_choice("q"), Some(Choice::Exit));
        assert_eq!(parse_choice("6"), None);
        assert_eq!(parse_choice(""), None);
    }
}
