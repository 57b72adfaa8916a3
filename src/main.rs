use clap::{crate_version, App, Arg};
use h2client::{Client, Config, Request};
use url::Url;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = App::new("h2client")
        .version(crate_version!())
        .arg(Arg::with_name("url").required(true).index(1))
        .arg(
            Arg::with_name("prior-knowledge")
                .long("prior-knowledge")
                .help("Skip the h2c upgrade dance on cleartext connections"),
        )
        .get_matches();
    let url = Url::parse(matches.value_of("url").expect("missing url")).expect("invalid url");

    let config = Config {
        prior_knowledge: matches.is_present("prior-knowledge"),
        ..Config::default()
    };
    let client = Client::new(config);
    match client.request(Request::get(url, None)).await {
        Ok(response) => println!("{}", response.text()),
        Err(err) => eprintln!("{err:#?}"),
    }
}
