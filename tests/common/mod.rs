use assert_cmd::Command;

pub fn triggerd_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("triggerd").expect("triggerd test binary should build")
    }
}
