use super::*;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("parse failed")
}

#[test]
fn parses_add_with_defaults() {
    let cli = parse(&["dlmgr", "add", "https://example.com/a.zip"]);
    match cli.command {
        CliCommand::Add { url, download_dir, queue } => {
            assert_eq!(url, "https://example.com/a.zip");
            assert!(download_dir.is_none());
            assert_eq!(queue, "Main");
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn parses_add_with_explicit_dir_and_queue() {
    let cli = parse(&["dlmgr", "add", "https://example.com/a.zip", "--download-dir", "/tmp/x", "--queue", "Overnight"]);
    match cli.command {
        CliCommand::Add { download_dir, queue, .. } => {
            assert_eq!(download_dir, Some(PathBuf::from("/tmp/x")));
            assert_eq!(queue, "Overnight");
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn parses_run_with_default_port() {
    let cli = parse(&["dlmgr", "run"]);
    match cli.command {
        CliCommand::Run { port } => assert_eq!(port, 7890),
        _ => panic!("wrong variant"),
    }
}

#[test]
fn global_verbose_flag_applies_before_or_after_subcommand() {
    let cli = parse(&["dlmgr", "--verbose", "status"]);
    assert!(cli.verbose);
    let cli = parse(&["dlmgr", "status"]);
    assert!(!cli.verbose);
}

#[test]
fn pause_resume_remove_take_an_id() {
    let cli = parse(&["dlmgr", "pause", "abc123"]);
    assert!(matches!(cli.command, CliCommand::Pause { id } if id == "abc123"));
    let cli = parse(&["dlmgr", "resume", "abc123"]);
    assert!(matches!(cli.command, CliCommand::Resume { id } if id == "abc123"));
    let cli = parse(&["dlmgr", "remove", "abc123"]);
    assert!(matches!(cli.command, CliCommand::Remove { id } if id == "abc123"));
}

#[test]
fn missing_subcommand_is_an_error() {
    assert!(Cli::try_parse_from(["dlmgr"]).is_err());
}
