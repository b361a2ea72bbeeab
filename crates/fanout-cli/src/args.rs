use anyhow::{bail, Context, Result};
use clap::Parser;

const TRIPLE_COLON: &str = ":::";

#[derive(Parser, Debug)]
#[command(
    name = "fanout",
    version,
    about = "Run a command once per argument in parallel, replaying each child's output in submission order",
    override_usage = "fanout    [-v] [-P children] [-I replacement] command [arguments] ::: arguments\n       fanout -s [-v] [-P children] [-I replacement] command [arguments] < arguments-in-lines"
)]
pub struct Cli {
    /// Get input from stdin, one argument per line
    #[arg(short = 's', long)]
    pub from_stdin: bool,

    /// Print the full command line before each execution
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// The replacement string substituted into the command template
    #[arg(short = 'I', long, value_name = "replacement", default_value = "{}")]
    pub replacement: String,

    /// Don't exit on error, keep going
    #[arg(long)]
    pub keep_going_on_error: bool,

    /// How many concurrent children to execute at once at maximum
    /// (default based on the number of cores)
    #[arg(
        short = 'P',
        long,
        value_name = "children",
        default_value_t = default_max_concurrent()
    )]
    pub max_concurrent: usize,

    /// How much system memory can be used for storing command outputs
    /// before producers start blocking; 'NUMBER%' or 'inf'
    #[arg(long, value_name = "memory", default_value = "5%")]
    pub max_mem: String,

    /// command [arguments...] ::: arguments
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "command"
    )]
    pub rest: Vec<String>,
}

/// A fully validated invocation: the command template plus the argument
/// source.
#[derive(Debug)]
pub struct Invocation {
    pub command: Vec<String>,
    pub data: Vec<String>,
    pub from_stdin: bool,
    pub verbose: bool,
    pub replacement: String,
    pub keep_going_on_error: bool,
    pub max_concurrent: usize,
    pub max_mem_bytes: u64,
}

pub fn parse() -> Result<Invocation> {
    let cli = Cli::parse();
    let max_mem_bytes = parse_max_mem(&cli.max_mem, total_system_memory())?;
    split_invocation(cli, max_mem_bytes)
}

fn split_invocation(cli: Cli, max_mem_bytes: u64) -> Result<Invocation> {
    if cli.rest.is_empty() {
        bail!("no command given; see --help");
    }
    if cli.max_concurrent == 0 {
        bail!("--max-concurrent must be at least 1");
    }

    let triple_colon = cli.rest.iter().position(|token| token == TRIPLE_COLON);
    let (command, data) = match triple_colon {
        Some(index) => (
            cli.rest[..index].to_vec(),
            cli.rest[index + 1..].to_vec(),
        ),
        None => {
            if !cli.from_stdin {
                bail!("neither -s (--from-stdin) nor ::: specified in the arguments");
            }
            (cli.rest.clone(), Vec::new())
        }
    };
    if command.is_empty() {
        bail!("no command given before :::");
    }

    Ok(Invocation {
        command,
        data,
        from_stdin: triple_colon.is_none(),
        verbose: cli.verbose,
        replacement: cli.replacement,
        keep_going_on_error: cli.keep_going_on_error,
        max_concurrent: cli.max_concurrent,
        max_mem_bytes,
    })
}

fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2)
        .max(2)
}

pub fn total_system_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}

/// `--max-mem` accepts a percentage of total system memory or `inf`. The
/// percentage is shaved by 2% to leave headroom for allocator overhead on
/// top of the accounted buffers.
pub fn parse_max_mem(spec: &str, total_memory: u64) -> Result<u64> {
    if spec == "inf" {
        return Ok(total_memory);
    }
    let Some(percentage) = spec.strip_suffix('%') else {
        bail!("--max-mem only accepts 'NUMBER%' and 'inf' as values, but got '{spec}'");
    };
    let percentage: f64 = percentage
        .parse()
        .with_context(|| format!("invalid value of --max-mem: '{spec}'"))?;
    if percentage < 0.0 {
        bail!("the value of --max-mem cannot be negative");
    }
    let percentage = percentage * 0.98;
    Ok((total_memory as f64 * percentage / 100.0) as u64)
}

/// Substitutes `argument` for every occurrence of the template in every
/// command token. A template-free command gets the argument appended
/// instead.
pub fn instantiate_command(command: &[String], argument: &str, template: &str) -> Vec<String> {
    if template.is_empty() {
        let mut out = command.to_vec();
        out.push(argument.to_string());
        return out;
    }

    let mut replaced_in = 0;
    let mut out = Vec::with_capacity(command.len() + 1);
    for word in command {
        if word.contains(template) {
            out.push(word.replace(template, argument));
            replaced_in += 1;
        } else {
            out.push(word.clone());
        }
    }
    if replaced_in == 0 {
        out.push(argument.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn template_substitutes_into_every_matching_token() {
        let command = strings(&["cp", "{}", "{}.bak"]);
        assert_eq!(
            instantiate_command(&command, "file", "{}"),
            strings(&["cp", "file", "file.bak"])
        );
    }

    #[test]
    fn argument_is_appended_without_a_template() {
        let command = strings(&["echo", "hi"]);
        assert_eq!(
            instantiate_command(&command, "there", "{}"),
            strings(&["echo", "hi", "there"])
        );
    }

    #[test]
    fn custom_replacement_tokens_work() {
        let command = strings(&["echo", "@@"]);
        assert_eq!(
            instantiate_command(&command, "z", "@"),
            strings(&["echo", "zz"])
        );
    }

    #[test]
    fn max_mem_percentage_is_shaved_for_overhead() {
        let total = 1000u64;
        assert_eq!(parse_max_mem("50%", total).expect("parse"), 490);
        assert_eq!(parse_max_mem("inf", total).expect("parse"), 1000);
    }

    #[test]
    fn malformed_max_mem_is_rejected() {
        assert!(parse_max_mem("lots", 1000).is_err());
        assert!(parse_max_mem("-5%", 1000).is_err());
        assert!(parse_max_mem("5", 1000).is_err());
    }

    #[test]
    fn triple_colon_splits_command_from_data() {
        let cli = Cli::parse_from(["fanout", "echo", "{}", ":::", "a", "b"]);
        let invocation = split_invocation(cli, 1024).expect("split");
        assert_eq!(invocation.command, strings(&["echo", "{}"]));
        assert_eq!(invocation.data, strings(&["a", "b"]));
        assert!(!invocation.from_stdin);
    }

    #[test]
    fn stdin_mode_needs_no_triple_colon() {
        let cli = Cli::parse_from(["fanout", "-s", "wc", "-l"]);
        let invocation = split_invocation(cli, 1024).expect("split");
        assert_eq!(invocation.command, strings(&["wc", "-l"]));
        assert!(invocation.from_stdin);
    }

    #[test]
    fn missing_argument_source_is_an_error() {
        let cli = Cli::parse_from(["fanout", "echo", "a"]);
        assert!(split_invocation(cli, 1024).is_err());
    }

    #[test]
    fn flags_after_the_command_belong_to_the_command() {
        let cli = Cli::parse_from(["fanout", "-v", "grep", "-v", "x", ":::", "f"]);
        let invocation = split_invocation(cli, 1024).expect("split");
        assert!(invocation.verbose);
        assert_eq!(invocation.command, strings(&["grep", "-v", "x"]));
    }
}
