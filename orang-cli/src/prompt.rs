use std::io::Write;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use orang::{ConflictPrompt, DialogResult};

/// Single-key conflict prompt for `sync --conflict ask`.
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn read_key() -> DialogResult {
        if enable_raw_mode().is_err() {
            return DialogResult::Cancel;
        }
        let result = loop {
            match event::read() {
                Ok(Event::Key(KeyEvent {
                    code, modifiers, ..
                })) => {
                    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
                        break DialogResult::Cancel;
                    }
                    match code {
                        KeyCode::Char('y') | KeyCode::Char('Y') => break DialogResult::Yes,
                        KeyCode::Char('a') | KeyCode::Char('A') => break DialogResult::YesToAll,
                        KeyCode::Char('n') | KeyCode::Char('N') => break DialogResult::No,
                        KeyCode::Char('o') | KeyCode::Char('O') => break DialogResult::NoToAll,
                        KeyCode::Char('s') | KeyCode::Enter => break DialogResult::None,
                        KeyCode::Char('c') | KeyCode::Esc => break DialogResult::Cancel,
                        _ => continue,
                    }
                }
                Ok(_) => continue,
                Err(_) => break DialogResult::Cancel,
            }
        };
        let _ = disable_raw_mode();
        result
    }
}

impl ConflictPrompt for TerminalPrompt {
    fn ask(&mut self, question: &str) -> DialogResult {
        print!("{question} [y]es [a]ll-yes [n]o [o]ther-all [s]kip [c]ancel ");
        let _ = std::io::stdout().flush();
        let answer = Self::read_key();
        println!(
            "{}",
            match answer {
                DialogResult::Yes => "y",
                DialogResult::YesToAll => "a",
                DialogResult::No => "n",
                DialogResult::NoToAll => "o",
                DialogResult::None => "s",
                DialogResult::Cancel => "c",
            }
        );
        answer
    }
}
