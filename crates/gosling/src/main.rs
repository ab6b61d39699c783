use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use ariadne::{Color, Label, Report, ReportKind, Source};
use clap::{Parser as ClapParser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use gosling::eval;
use gosling_compiler::{Compiler, Input, Program};
use gosling_lexer::LineIndex;
use gosling_object::Value;
use gosling_parser::ParseError;
use gosling_vm::VM;

/// gosling - a Go-subset scripting language
#[derive(ClapParser)]
#[command(name = "gosling")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gosling source file
    Run {
        /// Path to the source file
        file: PathBuf,
    },

    /// Start an interactive prompt
    Repl,

    /// Compile a file and print its bytecode
    Disasm {
        /// Path to the source file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { file }) => run_file(&file),
        Some(Commands::Disasm { file }) => disasm_file(&file),
        Some(Commands::Repl) | None => run_repl(),
    }
}

fn read_input(path: &PathBuf) -> Result<Input, ExitCode> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("error reading '{}': {}", path.display(), err);
            return Err(ExitCode::FAILURE);
        }
    };
    // A bare statement block is wrapped into a main function; a full
    // program starts with its package clause.
    let input = if content.trim_start().starts_with("package") {
        Input::file(path.to_string_lossy(), content)
    } else {
        Input::statements(content)
    };
    Ok(input)
}

fn run_file(path: &PathBuf) -> ExitCode {
    let input = match read_input(path) {
        Ok(input) => input,
        Err(code) => return code,
    };

    match evaluate(&input) {
        Ok(Some(value)) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

/// Parse, compile, and run one input, returning the program's value.
fn evaluate(input: &Input) -> Result<Option<Value>, ExitCode> {
    let prog = match Program::parse(input) {
        Ok(prog) => prog,
        Err(err) => {
            report_parse_error(input, &err);
            return Err(ExitCode::FAILURE);
        }
    };

    // Literal expressions take the tree-walker fast path.
    if let Some(value) = eval::eval_program(&prog) {
        return Ok(Some(value));
    }

    let mut compiler = Compiler::new();
    if let Err(err) = compiler.compile_program(&prog) {
        eprintln!("compile error: {}", err);
        return Err(ExitCode::FAILURE);
    }

    let mut vm = VM::new(compiler.bytecode());
    if let Err(err) = vm.run() {
        eprintln!("runtime error: {}", err);
        return Err(ExitCode::FAILURE);
    }

    match vm.last_popped() {
        Value::Null => Ok(None),
        value => Ok(Some(value.clone())),
    }
}

fn disasm_file(path: &PathBuf) -> ExitCode {
    let input = match read_input(path) {
        Ok(input) => input,
        Err(code) => return code,
    };

    let prog = match Program::parse(&input) {
        Ok(prog) => prog,
        Err(err) => {
            report_parse_error(&input, &err);
            return ExitCode::FAILURE;
        }
    };

    let mut compiler = Compiler::new();
    if let Err(err) = compiler.compile_program(&prog) {
        eprintln!("compile error: {}", err);
        return ExitCode::FAILURE;
    }
    let bytecode = compiler.bytecode();

    println!("== main ==");
    print!("{}", gosling_bytecode::disassemble(&bytecode.instructions));

    for constant in &bytecode.constants {
        match constant {
            Value::CompiledFunction(func) => {
                if func.name.is_empty() {
                    println!("\n== fn ==");
                } else {
                    println!("\n== fn {} ==", func.name);
                }
                print!("{}", gosling_bytecode::disassemble(&func.instructions));
            }
            Value::ForLoop(template) => {
                println!("\n== for loop ==");
                for (label, stream) in [
                    ("init", &template.init),
                    ("cond", &template.cond),
                    ("body", &template.body),
                    ("post", &template.post),
                ] {
                    if !stream.is_empty() {
                        println!("-- {} --", label);
                        print!("{}", gosling_bytecode::disassemble(stream));
                    }
                }
            }
            Value::RangeLoop(template) => {
                println!("\n== range loop ==");
                println!("-- x --");
                print!("{}", gosling_bytecode::disassemble(&template.x));
                println!("-- body --");
                print!("{}", gosling_bytecode::disassemble(&template.body));
            }
            _ => {}
        }
    }

    ExitCode::SUCCESS
}

fn run_repl() -> ExitCode {
    println!("gosling {} - interactive prompt", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl-D to quit.\n");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("error initializing the prompt: {}", err);
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline(">> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                let _ = editor.add_history_entry(line);

                let input = Input::statements(line);
                if let Ok(Some(value)) = evaluate(&input) {
                    println!("{}", value);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("error: {:?}", err);
                break;
            }
        }
    }

    ExitCode::SUCCESS
}

fn report_parse_error(input: &Input, err: &ParseError) {
    let source = input.source();
    if input.is_stmt {
        // Adjust positions past the wrapper the host added.
        let index = LineIndex::new(&source);
        let pos = index.position(err.span.start);
        let line = pos.line.saturating_sub(gosling_compiler::program::STMT_WRAPPER_LINES);
        eprintln!("{}:{} {}", line, pos.column, err);
        return;
    }

    let name = if input.name.is_empty() {
        "<input>"
    } else {
        &input.name
    };
    let start = err.span.start as usize;
    let end = (err.span.end as usize).max(start + 1);

    Report::<(&str, std::ops::Range<usize>)>::build(ReportKind::Error, name, start)
        .with_message("parse error")
        .with_label(
            Label::new((name, start..end))
                .with_message(err.to_string())
                .with_color(Color::Red),
        )
        .finish()
        .eprint((name, Source::from(source.as_str())))
        .ok();
}
