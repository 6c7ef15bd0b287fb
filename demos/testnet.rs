use std::time::Instant;

use mojito::{
    sim::{random_address, SimNetwork},
    Dht, DhtValueEntity, DhtValueType, EntityKey, Kuid,
};

use clap::Parser;

use tracing::Level;
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of simulated nodes
    #[arg(short, long, default_value_t = 50)]
    nodes: usize,
    /// Value to store and look up again
    #[arg(short, long, default_value = "Hello mojito")]
    value: String,
}

fn main() {
    tracing_subscriber::fmt()
        // Switch to DEBUG to follow the bootstrap phases
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    let network = SimNetwork::new();
    let mesh = network.spawn_mesh(cli.nodes);

    let dht = Dht::builder()
        .dispatcher(network.clone())
        .address(random_address())
        .build()
        .unwrap();

    println!("Bootstrapping {} from {} nodes ...", dht.local_id(), mesh.len());
    let start = Instant::now();

    let result = dht.bootstrap(mesh[0].clone()).get().unwrap();
    let (size, alive) = {
        let table = dht.routing_table();
        (table.size(), table.alive_percentage())
    };

    println!(
        "Bootstrap {:?} in {:?} milliseconds, {} contacts ({}% alive).",
        result.result_type,
        start.elapsed().as_millis(),
        size,
        (alive * 100.0) as u32
    );

    let key = Kuid::from_content(cli.value.as_bytes());
    let entity = DhtValueEntity::new(key, dht.local_id(), DhtValueType::Text, cli.value);

    let start = Instant::now();
    let stored = dht.store(vec![entity]).unwrap().get().unwrap();

    println!(
        "\nStored at {} nodes in {:?} milliseconds, {} failed.",
        stored.stored_at.len(),
        start.elapsed().as_millis(),
        stored.failed.len()
    );

    let start = Instant::now();
    let found = dht
        .find_value(EntityKey::lookup(key, DhtValueType::Any))
        .get()
        .unwrap();

    for entity in found.entities {
        println!(
            "\nFound {:?} in {:?} milliseconds.",
            String::from_utf8_lossy(&entity.value),
            start.elapsed().as_millis()
        );
    }

    dht.shutdown();
}
