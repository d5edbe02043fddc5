use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    faas_runtime_handler::run(simple_handler::greet).await
}
