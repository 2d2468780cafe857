fn main() -> anyhow::Result<()> {
    botmaster::pm::botctl_cli::run()
}
