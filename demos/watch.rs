//! Minimal observer: prints every change under the given directory until
//! the user presses enter.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use treewatch::FileSystemWatcher;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("one input parameter is needed");
        return ExitCode::FAILURE;
    };

    println!("observed path is '{path}'");

    let watcher = FileSystemWatcher::new(path, Duration::from_millis(1), |events| {
        for event in &events {
            println!(
                "{} with the type: {:016b}",
                event.path.display(),
                event.kind.bits()
            );
        }
    });

    println!("Press any key to finish the observation!");
    let _ = io::stdin().read_line(&mut String::new());
    drop(watcher);

    ExitCode::SUCCESS
}
