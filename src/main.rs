//! patchmirror - a JACK routing-graph mirror
//!
//! Keeps a stably-identified model of the JACK/ALSA MIDI routing graph,
//! reconciled from the JACK client API, jackdbus and `aconnect`, and
//! streams every change as JSON lines on stdout for a canvas process.

mod config;
mod graph;
mod runtime;
mod sources;

fn main() {
    // Logs go to stderr; stdout carries the projection stream
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting patchmirror");

    let prefs = config::load_preferences();
    log::debug!("Preferences: {:?}", prefs);

    let projection = graph::JsonLinesProjection::new(std::io::stdout().lock());
    let runtime = runtime::Runtime::new(&prefs, projection);
    let sync = runtime.run(&prefs);

    let counts = sync.model().counts();
    log::info!(
        "Stopped with {} groups, {} ports, {} connections",
        counts.groups,
        counts.ports,
        counts.connections
    );
}
