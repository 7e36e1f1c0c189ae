fn main() -> anyhow::Result<()> {
	gatehouse_app::run()
}
