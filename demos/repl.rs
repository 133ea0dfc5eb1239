use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use sigilisp::builtinops::available_dialects;
use sigilisp::{Error, Interpreter, ParseState, Value, parse};
use std::panic;
use std::process;
use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install a subscriber only when `RUST_LOG` is set, e.g. `RUST_LOG=sigilisp=debug`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}

fn main() {
    init_tracing();

    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn run_repl() {
    println!("sigilisp interactive interpreter");
    println!("Enter expressions like: (+ 1 2) or (:= @xs '(1 2 3))");
    println!("Unfinished input continues on the next line.");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => {
            eprintln!("Could not initialize REPL: {err}");
            process::exit(1);
        }
    };
    let mut interp = Interpreter::new();

    // Callable from scripts as well as through `:help`
    interp.register_builtin_operation::<_, ()>("help", print_help);

    let mut pending: Option<ParseState> = None;

    loop {
        let prompt = match &pending {
            Some(_) => format!("{}...> ", interp.dialect().name),
            None => format!("{}> ", interp.dialect().name),
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                if pending.is_none() {
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(command);

                    match command {
                        ":help" => {
                            let _ = print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(&interp);
                            continue;
                        }
                        ":dialects" => {
                            for dialect in available_dialects() {
                                println!("  {:<10} {}", dialect.name, dialect.description);
                            }
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                } else {
                    let _ = rl.add_history_entry(line.as_str());
                }

                // Lines are fed one at a time, so restore the newline the editor strips
                let chunk = format!("{line}\n");
                match parse(&chunk, pending.take()) {
                    Ok((_, Some(state))) => pending = Some(state),
                    Ok((tree, None)) => {
                        // Each top-level form is its own error boundary
                        for form in &tree.forms {
                            match interp.run(form) {
                                Ok(value) => println!("{value}"),
                                Err(e) => report(&e),
                            }
                        }
                    }
                    Err(e) => report(&e),
                }
            }

            Err(ReadlineError::Interrupted) if pending.is_some() => {
                println!("(input discarded)");
                pending = None;
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn report(error: &Error) {
    println!("Error: {error}");
}

fn print_help() -> Result<Value, Error> {
    println!("sigilisp commands:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show global bindings");
    println!("  :dialects  - List the available dialects");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+C     - Discard unfinished input, or exit");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Values:");
    println!("  Numbers: 42, -5, 2.5     Strings: \"text\"     Atoms: t, nil, foo");
    println!("  Lists: '(1 2 3)          Dictionaries: `((a 1) (b 2))");
    println!("  Variables: $scalar @list %dictionary");
    println!();
    println!("Forms:");
    println!("  (:= $x 42)                       assignment, sigil must match the value");
    println!("  (if cond then... else else...)   cond must be t or nil");
    println!("  (for $x in '(1 2 3) body...)");
    println!("  (fn name ($a (@rest)) body...)   trailing (@rest) collects extra arguments");
    println!("  (dialect extended)               switch builtin tables");
    println!();
    println!("Comments: ; to end of line, #| nested |# blocks");
    println!();

    Ok(Value::nil())
}

fn print_environment(interp: &Interpreter) {
    let bindings = interp.bindings();

    if bindings.is_empty() {
        println!("No global bindings. Builtins of the {} dialect:", interp.dialect().name);
    } else {
        println!("Global bindings ({} total):", bindings.len());
        for (name, value) in bindings {
            println!("  {name} = {value}");
        }
        println!();
        println!("Builtins of the {} dialect:", interp.dialect().name);
    }

    // Print in columns for readability
    let mut col = 0;
    for name in interp.dialect().names() {
        print!("  {name:<12}");
        col += 1;
        if col % 6 == 0 {
            println!();
        }
    }
    if col % 6 != 0 {
        println!();
    }
}
