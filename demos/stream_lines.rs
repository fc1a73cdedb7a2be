//! Streams the lines written by a shell loop, one at a time, stopping early
//! once the line for 7 has been seen.

use std::ops::ControlFlow;
use cmdchain::*;

fn main() -> anyhow::Result<()>
{
    let config = ChainConfig::default().executor(Executor::NormalWithEcho);
    let result = CommandChain::with_config(config)
        .command("bash", ["-c", "for n in {0..9}; do echo \"line $n\"; sleep 0.1; done"])
        .pipe()
        .command("tr", ["a-z", "A-Z"])
        .run_and_stream_lines(|line| {
            println!("got: {}", line);
            if line.ends_with('7') {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
    println!("exit codes: {:?}", result.exit_codes());
    Ok(())
}
