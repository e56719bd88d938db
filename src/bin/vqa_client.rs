use argh::FromArgs;
use reqwest::multipart::{Form, Part};
use std::path::PathBuf;
use vqa_birds::messages::PredictRequest;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5000;

#[derive(FromArgs)]
/// Client for the bird question-answering service
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// how to send the image: "url" or "upload"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Url(UrlCommand),
    Upload(UploadCommand),
}

#[derive(FromArgs)]
/// Ask about an image reachable by URL
#[argh(subcommand, name = "url")]
struct UrlCommand {
    /// the image URL
    #[argh(option, short = 'u')]
    image_url: String,

    /// the question to ask
    #[argh(option, short = 'q')]
    question: String,
}

#[derive(FromArgs)]
/// Ask about a local image file
#[argh(subcommand, name = "upload")]
struct UploadCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image: PathBuf,

    /// the question to ask
    #[argh(option, short = 'q')]
    question: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let url = format!("http://{}:{}/predict", args.host, args.port);

    let request = match args.command {
        ClientCommands::Url(command) => client.post(&url).json(&PredictRequest {
            image_url: Some(command.image_url),
            question: Some(command.question),
        }),
        ClientCommands::Upload(command) => {
            let file_name = command
                .image
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let bytes = tokio::fs::read(&command.image).await?;
            let form = Form::new()
                .text("question", command.question)
                .part("image", Part::bytes(bytes).file_name(file_name));
            client.post(&url).multipart(form)
        }
    };

    let response = request.send().await?;
    let status = response.status();
    let result = response.json::<serde_json::Value>().await?;
    println!("Status: {status}");
    println!("Result: {}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
