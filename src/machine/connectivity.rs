//! Static connectivity queries.
//!
//! These ignore occupancy entirely; they answer whether the interconnect can
//! ever transport a value between two endpoints.

use super::*;

impl Machine {
    /// Buses reading `src` and writing `dst`.
    pub fn buses_connecting(&self, src: Endpoint, dst: Endpoint) -> impl Iterator<Item = BusId> + '_ {
        self.bus_ids()
            .filter(move |b| self.bus(*b).reads(src) && self.bus(*b).writes(dst))
    }

    pub fn is_connected(&self, src: Endpoint, dst: Endpoint) -> bool {
        self.buses_connecting(src, dst).next().is_some()
    }

    /// True if some bus writing `dst` can carry `value` in its short immediate field.
    pub fn can_transport_short_immediate(&self, value: i64, dst: Endpoint) -> bool {
        self.buses
            .iter()
            .any(|b| b.writes(dst) && b.can_carry_immediate(value))
    }

    /// Immediate units able to hold `value` whose registers some bus carries to `dst`.
    pub fn immediate_units_reaching(&self, value: i64, dst: Endpoint) -> Vec<IuId> {
        self.iu_ids()
            .filter(|iu| {
                self.immediate_unit(*iu).can_hold(value)
                    && self.is_connected(Endpoint::ImmediateUnit(*iu), dst)
            })
            .collect()
    }

    /// True if `value` can reach `dst` either as a short or a long immediate.
    pub fn can_transport_immediate(&self, value: i64, dst: Endpoint) -> bool {
        self.can_transport_short_immediate(value, dst)
            || !self.immediate_units_reaching(value, dst).is_empty()
    }

    /// Register files readable by a bus that writes `dst`.
    pub fn register_files_reaching(&self, dst: Endpoint) -> Vec<RfId> {
        self.rf_ids()
            .filter(|rf| self.is_connected(Endpoint::RegisterFile(*rf), dst))
            .collect()
    }

    /// Register files written by a bus that reads `src`.
    pub fn register_files_reachable_from(&self, src: Endpoint) -> Vec<RfId> {
        self.rf_ids()
            .filter(|rf| self.is_connected(src, Endpoint::RegisterFile(*rf)))
            .collect()
    }

    /// Port endpoint of operand `operand` of `op` on `fu`.
    pub fn operand_endpoint(&self, fu: FuId, op: OpId, operand: u8) -> Option<Endpoint> {
        let port = self.function_unit(fu).hw_operation(op)?.port(operand)?;
        Some(Endpoint::FuPort { fu, port })
    }

    /// Return address port of the control unit.
    pub fn return_address_endpoint(&self) -> Endpoint {
        Endpoint::FuPort {
            fu: self.control_unit.fu,
            port: self.control_unit.ra_port,
        }
    }

    pub fn endpoint_name(&self, endpoint: Endpoint) -> String {
        match endpoint {
            Endpoint::FuPort { fu, port } => {
                let unit = self.function_unit(fu);
                format!("{}.{}", unit.name, unit.ports[port as usize].name)
            }
            Endpoint::RegisterFile(rf) => self.register_file(rf).name.clone(),
            Endpoint::ImmediateUnit(iu) => self.immediate_unit(iu).name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::presets;
    use super::*;

    #[test]
    fn test_clustered_connectivity() {
        let m = presets::clustered().unwrap();
        let rf_a = m.rf_by_name("RFA").unwrap();
        let rf_b = m.rf_by_name("RFB").unwrap();
        let alu_b = m.fu_by_name("ALUB").unwrap();
        let add = m.operation_by_name("add").unwrap();
        let in2 = m.operand_endpoint(alu_b, add, 2).unwrap();
        assert!(!m.is_connected(Endpoint::RegisterFile(rf_a), in2));
        assert!(m.is_connected(Endpoint::RegisterFile(rf_b), in2));
        assert!(m
            .register_files_reachable_from(Endpoint::RegisterFile(rf_a))
            .contains(&rf_b));
        let reaching = m.register_files_reaching(in2);
        assert!(reaching.contains(&rf_b));
        assert!(!reaching.contains(&rf_a));
    }

    #[test]
    fn test_long_immediate_reach() {
        let m = presets::minimal().unwrap();
        let rf = m.rf_by_name("RF").unwrap();
        let dst = Endpoint::RegisterFile(rf);
        assert!(m.can_transport_short_immediate(5, dst));
        assert!(!m.can_transport_short_immediate(100_000, dst));
        assert_eq!(m.immediate_units_reaching(100_000, dst).len(), 1);
        assert!(m.can_transport_immediate(100_000, dst));
    }
}
