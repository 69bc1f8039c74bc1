// File: src/repl.rs
//
// Interactive REPL (spec.md §6 expansion). A single `Vm` persists across
// inputs so top-level `var`/`const`/`fun`/`class` declarations survive
// between lines; each accepted line is compiled and run as its own
// program against that same VM. Compile and runtime errors print and
// return to the prompt rather than exiting the process.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{InterpretResult, Vm};

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "Ruff REPL".bright_cyan().bold());
        println!(
            "{}",
            "Type an expression or statement; unclosed braces/brackets/parens continue on the next line.".dimmed()
        );
        println!("{}", "Ctrl+D to exit.".dimmed());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "ruff> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if Self::is_input_complete(&buffer) {
                        let source = std::mem::take(&mut buffer);
                        self.eval(&source);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                    println!("{}", "(interrupted)".bright_yellow());
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Balances braces/brackets/parens outside of string literals; a
    /// trailing unterminated `"..."` also keeps the input open.
    fn is_input_complete(input: &str) -> bool {
        let mut depth = 0i32;
        let mut in_string = false;

        for ch in input.chars() {
            match ch {
                '"' => in_string = !in_string,
                '{' | '[' | '(' if !in_string => depth += 1,
                '}' | ']' | ')' if !in_string => depth -= 1,
                _ => {}
            }
        }

        !in_string && depth <= 0
    }

    fn eval(&mut self, source: &str) {
        if source.trim().is_empty() {
            return;
        }
        match self.vm.interpret(source) {
            InterpretResult::Ok => {}
            InterpretResult::CompileError | InterpretResult::RuntimeError => {
                // The VM and compiler already printed a diagnostic; the
                // REPL just stays at the prompt instead of exiting.
            }
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("Failed to create REPL")
    }
}
