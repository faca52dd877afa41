use std::borrow::Cow;
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Cmd, Completer, Context, Editor, EventHandler, KeyCode, KeyEvent, Modifiers};
use rustyline::{Helper, Highlighter, Hinter, Validator};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use lips::evaluator::special_form_identifiers;
use lips::{Environment, Sexpr, Token, TokenKind, exec_each, tokenize};

type Env = Rc<RefCell<Environment>>;

/// Interactive interpreter for the lips language.
#[derive(Parser, Debug)]
#[command(name = "lips-repl", version, about, long_about = None)]
struct Args {
    /// Resolve free variables through the caller's frames instead of the
    /// defining ones.
    #[arg(short, long)]
    dynamic: bool,

    /// Use vi key bindings.
    #[arg(long)]
    vi: bool,

    /// Where to keep the line history.
    #[arg(long, default_value = "lips_history.txt")]
    history: PathBuf,

    /// Run the given files and exit without starting the prompt.
    #[arg(long)]
    no_repl: bool,

    /// Source files evaluated, in order, before the prompt starts.
    files: Vec<PathBuf>,
}

struct LipsCompleter {
    env: Env,
}

impl LipsCompleter {
    fn new(env: Env) -> Self {
        LipsCompleter { env }
    }
}

impl rustyline::completion::Completer for LipsCompleter {
    type Candidate = String;
    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let tokens = tokenize(&line[..pos]);
        let prefix = match tokens.last() {
            Some(token) if token.kind == TokenKind::Symbol && token.span.end == pos => {
                token.text.clone()
            }
            _ => return Ok((pos, vec![])),
        };
        let mut candidates: Vec<String> = self
            .env
            .borrow()
            .get_identifiers()
            .union(&special_form_identifiers())
            .filter_map(|id| id.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect();
        candidates.sort();
        Ok((pos, candidates))
    }
}

#[derive(Completer, Helper, Highlighter, Hinter, Validator)]
struct LipsHelper {
    #[rustyline(Validator)]
    validator: LipsValidator,
    #[rustyline(Highlighter)]
    highlighter: LipsHighlighter,
    #[rustyline(Completer)]
    completer: LipsCompleter,
}

struct LipsValidator;

impl Validator for LipsValidator {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        let mut depth = 0usize;
        for token in tokenize(ctx.input()) {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    if depth == 0 {
                        return Ok(ValidationResult::Invalid(Some(format!(
                            "  - Unmatched ')' at position {}",
                            token.span.start
                        ))));
                    }
                    depth -= 1;
                }
                // A string left open keeps swallowing lines.
                TokenKind::UnterminatedString => return Ok(ValidationResult::Incomplete),
                _ => {}
            }
        }

        if depth > 0 {
            Ok(ValidationResult::Incomplete)
        } else {
            Ok(ValidationResult::Valid(None))
        }
    }
}

/// Finds the bracket pair touching the cursor, as token indexes.
fn matching_parens(tokens: &[Token], pos: usize) -> Option<(usize, usize)> {
    let touches = |token: &Token| token.span.start == pos || token.span.end == pos;
    let mut open = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => open.push(i),
            TokenKind::RParen => {
                if let Some(start) = open.pop()
                    && (touches(&tokens[start]) || touches(token))
                {
                    return Some((start, i));
                }
            }
            _ => {}
        }
    }
    None
}

struct LipsHighlighter {
    env: Env,
}

impl Highlighter for LipsHighlighter {
    fn highlight<'l>(&self, line: &'l str, pos: usize) -> Cow<'l, str> {
        let tokens = tokenize(line);
        let matching = matching_parens(&tokens, pos);
        let macros = self.env.borrow().get_macro_names();
        let mut highlighted = String::with_capacity(line.len());
        let mut last = 0;

        for (i, token) in tokens.iter().enumerate() {
            // Whitespace and comments between tokens pass through untouched.
            highlighted.push_str(&line[last..token.span.start]);
            let color = match token.kind {
                TokenKind::String | TokenKind::UnterminatedString => Some("32"),
                TokenKind::Regex => Some("35"),
                TokenKind::Number | TokenKind::Boolean => Some("36"),
                TokenKind::Invalid => Some("31"),
                TokenKind::Symbol if macros.contains(&token.text) => Some("33"),
                TokenKind::LParen | TokenKind::RParen
                    if matching.is_some_and(|(open, close)| open == i || close == i) =>
                {
                    Some("1;34")
                }
                _ => None,
            };
            match color {
                Some(code) => highlighted.push_str(&format!("\x1b[{}m{}\x1b[0m", code, token.text)),
                None => highlighted.push_str(&token.text),
            }
            last = token.span.end;
        }
        highlighted.push_str(&line[last..]);

        Cow::Owned(highlighted)
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

/// Runs every form in `input`, reporting failures against `source_id`.
/// Returns false if anything failed.
fn run_source(source_id: &str, input: &str, env: &Env, dynamic: bool, echo: bool) -> bool {
    let dynamic_env = dynamic.then_some(env);
    let results = match exec_each(input, env, dynamic_env) {
        Ok(results) => results,
        Err(parse_err) => {
            if parse_err.pretty_print(source_id, input).is_err() {
                eprintln!("Parse Error: {}", parse_err);
            }
            return false;
        }
    };

    let mut ok = true;
    for result in results {
        match result {
            Ok(node) => {
                if echo && !matches!(node.kind, Sexpr::Undefined) {
                    println!("{}", node);
                }
            }
            Err(e) => {
                ok = false;
                if e.pretty_print(source_id, input).is_err() {
                    eprintln!("Error: {}", e);
                }
            }
        }
    }
    ok
}

fn main() -> rustyline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    debug!(?args, "starting");

    let global_env = Environment::new_global_populated();

    let mut all_ok = true;
    for path in &args.files {
        let source = fs::read_to_string(path)?;
        let source_id = path.display().to_string();
        info!(file = %source_id, "loading");
        all_ok &= run_source(&source_id, &source, &global_env, args.dynamic, false);
    }
    if args.no_repl {
        if !all_ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    println!("lips REPL v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl-D to quit.");

    let helper = LipsHelper {
        highlighter: LipsHighlighter {
            env: global_env.clone(),
        },
        validator: LipsValidator,
        completer: LipsCompleter::new(global_env.clone()),
    };
    let edit_mode = if args.vi {
        rustyline::EditMode::Vi
    } else {
        rustyline::EditMode::Emacs
    };
    let config = rustyline::config::Config::builder()
        .edit_mode(edit_mode)
        .build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(helper));
    rl.bind_sequence(
        KeyEvent(KeyCode::Char('s'), Modifiers::CTRL),
        EventHandler::Simple(Cmd::Newline),
    );
    if rl.load_history(&args.history).is_err() {
        println!("No previous history.");
    }

    loop {
        match rl.readline("lips> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let trimmed_input = line.trim();
                if trimmed_input.is_empty() {
                    continue;
                }
                if trimmed_input.eq_ignore_ascii_case("exit") {
                    break;
                }
                run_source("REPL", trimmed_input, &global_env, args.dynamic, true);
            }
            Err(ReadlineError::Interrupted) => {
                println!("Interrupted. Type 'exit' or Ctrl-D to quit.");
            }
            Err(ReadlineError::Eof) => {
                println!("\nExiting.");
                break;
            }
            Err(err) => {
                eprintln!("Readline Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history(&args.history)
}
