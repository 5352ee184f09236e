use ble_led_panel::presentation::app::App;
use ble_led_panel::presentation::cli::Cli;
use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app = App::new(&cli)?;

    tracing::info!("Starting BLE LED panel");
    app.run(cli.command).await
}
