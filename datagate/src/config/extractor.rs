use datagate_services::transport::TransportSettings;
use service_async::Param;

use super::ServerConfig;

impl Param<TransportSettings> for ServerConfig {
    fn param(&self) -> TransportSettings {
        TransportSettings::from(&self.transport)
    }
}
