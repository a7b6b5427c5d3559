use crate::config::LOGGING_ENABLED;
use crate::peer::types::IceCandidate;
use once_cell::sync::OnceCell;
use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Формат временных меток в логах
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

static INIT: OnceCell<()> = OnceCell::new();

/// Фильтр по умолчанию, если RUST_LOG не задан
fn default_directive() -> &'static str {
    if LOGGING_ENABLED {
        "ssc_pair=debug,info"
    } else {
        "warn"
    }
}

/// Инициализация логирования; повторные вызовы ничего не делают
pub fn init() {
    init_with(None)
}

/// Инициализация с явным фильтром (например из аргументов командной строки)
pub fn init_with(filter: Option<&str>) {
    INIT.get_or_init(|| {
        let filter = filter
            .and_then(|f| EnvFilter::try_new(f).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new(default_directive()));

        // try_init: в тестах подписчик мог быть установлен раньше
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
            .with_target(true)
            .try_init();
    });
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        connection_id = %cand.connection_id,
        "trickle candidate"
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "nominated candidate pair"
                );
            }
        }
    }
}
