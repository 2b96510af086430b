use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use structopt::StructOpt;

mod operations;

/// Command-line client for the corpus annotation job coordinator.
#[derive(StructOpt, Debug)]
#[structopt(name = "annoq-client")]
struct Opt {
    /// Base URL of the coordinator server.
    #[structopt(long, default_value = "http://localhost:8000")]
    url: String,

    /// User id passed to the server.
    #[structopt(long)]
    user: String,

    /// Operator secret, needed for the advance operation.
    #[structopt(long)]
    secret_key: Option<String>,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Queue an annotation run for a corpus.
    Run(RunOperation),
    /// Queue an install run for a corpus.
    Install(InstallOperation),
    /// Show the status of one corpus, or of all jobs.
    Status(StatusOperation),
    /// Abort the job of a corpus.
    Abort(CorpusOperation),
    /// Remove a corpus job, locally and from the annotation server.
    Remove(RemoveOperation),
    /// Remove annotations or exports from the annotation server.
    Clean(CleanOperation),
    /// Trigger one queue reconciliation pass.
    Advance,
}

#[derive(Debug, StructOpt)]
struct RunOperation {
    #[structopt(name = "CORPUS_ID")]
    corpus_id: String,
    /// Comma-separated export formats.
    #[structopt(long)]
    exports: Option<String>,
    /// Comma-separated subset of source files to process.
    #[structopt(long)]
    files: Option<String>,
}

#[derive(Debug, StructOpt)]
struct InstallOperation {
    #[structopt(name = "CORPUS_ID")]
    corpus_id: String,
    #[structopt(long)]
    scramble: bool,
}

#[derive(Debug, StructOpt)]
struct StatusOperation {
    #[structopt(name = "CORPUS_ID")]
    corpus_id: Option<String>,
}

#[derive(Debug, StructOpt)]
struct CorpusOperation {
    #[structopt(name = "CORPUS_ID")]
    corpus_id: String,
}

#[derive(Debug, StructOpt)]
struct RemoveOperation {
    #[structopt(name = "CORPUS_ID")]
    corpus_id: String,
    /// Remove even while a remote process is running.
    #[structopt(long)]
    force: bool,
}

#[derive(Debug, StructOpt)]
struct CleanOperation {
    #[structopt(name = "CORPUS_ID")]
    corpus_id: String,
    /// Only remove export files.
    #[structopt(long)]
    exports: bool,
}

fn main() {
    let opt = Opt::from_args();

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-user-id",
        HeaderValue::from_str(&opt.user).expect("invalid user id"),
    );
    if let Some(secret_key) = &opt.secret_key {
        headers.insert(
            "x-secret-key",
            HeaderValue::from_str(secret_key).expect("invalid secret key"),
        );
    }
    let client = Client::builder()
        .default_headers(headers)
        .build()
        .expect("could not build http client");

    let output = match opt.operation {
        Operation::Run(run) => {
            operations::run(&client, &opt.url, &run.corpus_id, run.exports, run.files)
        }
        Operation::Install(install) => {
            operations::install(&client, &opt.url, &install.corpus_id, install.scramble)
        }
        Operation::Status(status) => match status.corpus_id {
            Some(corpus_id) => operations::status(&client, &opt.url, &corpus_id),
            None => operations::list(&client, &opt.url),
        },
        Operation::Abort(abort) => operations::abort(&client, &opt.url, &abort.corpus_id),
        Operation::Remove(remove) => {
            operations::remove(&client, &opt.url, &remove.corpus_id, remove.force)
        }
        Operation::Clean(clean) => {
            operations::clean(&client, &opt.url, &clean.corpus_id, clean.exports)
        }
        Operation::Advance => operations::advance(&client, &opt.url),
    };
    println!("{}", output);
}
