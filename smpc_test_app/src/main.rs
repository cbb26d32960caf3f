use argh::FromArgs;
use ndarray::arr2;
use smpc::{FixedPointSpec, Modulus, Public, SessionConfig};

#[derive(FromArgs)]
/// Demo tour of the sharing engine.
struct Options {
    /// session config file; a built-in three-party session when omitted
    #[argh(option)]
    config: Option<String>,
}

fn builtin_config() -> SessionConfig {
    SessionConfig {
        parties: vec!["alice".into(), "bob".into(), "james".into()],
        modulus: Modulus::PowerOfTwo(64),
        fixed_point: Some(FixedPointSpec::default()),
        seed: Some(42),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let options: Options = argh::from_env();
    let config = match &options.config {
        Some(path) => SessionConfig::load_file(path).unwrap(),
        None => builtin_config(),
    };
    let session = config.build().unwrap();
    println!(
        "Session over {:?} with {} parties",
        session.ring,
        session.parties.len()
    );

    let x = session
        .share_floats(&arr2(&[[0.1, 0.2], [0.3, 0.4]]).into_dyn())
        .await
        .unwrap();
    let y = session
        .share_floats(&arr2(&[[4.5, 3.5], [1.5, 2.5]]).into_dyn())
        .await
        .unwrap();

    let sum = x.add(&y).await.unwrap();
    println!("x + y =\n{}", sum.reconstruct().await.unwrap().float_precision());

    let product = x.mul(&y).await.unwrap();
    println!(
        "x * y =\n{}",
        product.reconstruct().await.unwrap().float_precision()
    );

    let contracted = x.matmul(&y).await.unwrap();
    println!(
        "x @ y =\n{}",
        contracted.reconstruct().await.unwrap().float_precision()
    );

    let halved = y.div_public(&Public::Float(2.0)).await.unwrap();
    println!(
        "y / 2 =\n{}",
        halved.reconstruct().await.unwrap().float_precision()
    );

    let below = x.lt(&y).await.unwrap();
    println!(
        "x < y =\n{}",
        below.reconstruct().await.unwrap().float_precision()
    );

    let mean = x.mean(Some(&[1]), false).await.unwrap();
    println!(
        "mean(x, axis 1) =\n{}",
        mean.reconstruct().await.unwrap().float_precision()
    );

    let arg = y.argmax(Some(1), false).await.unwrap();
    println!(
        "argmax(y, axis 1) =\n{}",
        arg.reconstruct().await.unwrap().float_precision()
    );

    let stats = session.provider.stats();
    dbg!(stats);
    assert!(stats.triples > 0 && stats.bit_masks > 0 && stats.truncation_masks > 0);
}
