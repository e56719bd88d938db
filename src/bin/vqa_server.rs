use argh::FromArgs;
use std::sync::Arc;
use vqa_birds::{
    checkpoint::{self, DEFAULT_MODEL_ID, ModelFiles},
    knowledge::{DEFAULT_API_URL, DEFAULT_SENTENCES, Wikipedia},
    server::{self, DEFAULT_HOST, DEFAULT_PORT},
    service::{HttpImageFetcher, VqaService},
};

#[derive(FromArgs)]
/// Answers questions about bird images over HTTP.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// hub id or local directory of the model to serve
    #[argh(option, short = 'm', default = "DEFAULT_MODEL_ID.to_string()")]
    model: String,

    /// mediawiki action API used for answer summaries
    #[argh(option, default = "DEFAULT_API_URL.to_string()")]
    wiki_api: String,

    /// number of sentences in each summary
    #[argh(option, default = "DEFAULT_SENTENCES")]
    sentences: usize,

    /// run on CPU even if a GPU is available
    #[argh(switch)]
    cpu: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    // blocking clients and the model are built before the async runtime starts
    let device = checkpoint::select_device(args.cpu)?;
    log::info!("Loading model {} on {:?}", args.model, device);
    let pipeline = checkpoint::load_pipeline(&ModelFiles::locate(&args.model)?, &device)?;
    let knowledge = Wikipedia::with_api_url(&args.wiki_api)?.with_sentences(args.sentences);
    let service = Arc::new(VqaService::new(
        pipeline,
        Box::new(knowledge),
        Box::new(HttpImageFetcher::new()?),
    ));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let app = server::router(service.clone());

        log::info!("Starting the server");
        log::info!("Listening on: {}", addr);
        log::info!("Press Ctrl+C to stop the server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
