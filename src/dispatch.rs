//! Command dispatcher.
//!
//! Maps one command and the caller's IP to one response string. All shared
//! state of the simulated handler lives here; sessions only hold an `Arc`
//! to the dispatcher and their own peer address.
//!
//! Dispatching never fails. Malformed input, missing parameters and bad
//! values are all answered with negative responses.

use crate::dut::{DutPool, DutRecord};
use crate::protocol::{self, format_temp, Frame, Response, SiteToken};
use crate::storage::{AllocationTable, Release, SiteTemperatures, SummaryEntry, SummaryLog};
use crate::summary::SummaryWriter;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Accepted `SetSiteTemp` range, inclusive
const MIN_SITE_TEMP: f64 = -40.0;
const MAX_SITE_TEMP: f64 = 150.0;

/// Junction temperature sits this far below the site setpoint
const JUNCTION_OFFSET: f64 = 10.0;
/// Case temperature sits this far above the site setpoint
const CASE_OFFSET: f64 = 5.0;

const GET_ID: &str = "<<%ID%MODEL=HS-3000;SERIAL=SIM00001;FIRMWARE=1.0.0>>";
const GET_HANDLER_STATUS: &str = "<<%HANDLERSTATUS%STATE=RUNNING;ALARM=0;DOOR=CLOSED>>";
const ENABLE_TEMP_LOG: &str = "<<%ACK%CMD=EnableTempLog>>";
const DISABLE_TEMP_LOG: &str = "<<%ACK%CMD=DisableTempLog>>";
const ENABLE_TSD: &str = "<<%ACK%CMD=EnableTSD>>";
const DISABLE_TSD: &str = "<<%ACK%CMD=DisableTSD>>";

/// Shared handler state plus the command table
pub struct Dispatcher {
    pool: DutPool,
    allocations: AllocationTable,
    temperatures: SiteTemperatures,
    summary: SummaryLog,
    writer: SummaryWriter,
    lot_info: String,
}

impl Dispatcher {
    pub fn new(pool: DutPool, writer: SummaryWriter, lot_id: &str) -> Self {
        let lot_info = Response::envelope(
            None,
            "LOTINFO",
            &[("LOT", lot_id), ("UNITS", &pool.len().to_string())],
        );

        Dispatcher {
            pool,
            allocations: AllocationTable::new(),
            temperatures: SiteTemperatures::new(),
            summary: SummaryLog::new(),
            writer,
            lot_info,
        }
    }

    /// Answer one trimmed command from `peer`. Empty input gets an empty
    /// response, which the session does not send.
    pub fn dispatch(&self, command: &str, peer: IpAddr) -> String {
        let command = command.trim();
        if command.is_empty() {
            return String::new();
        }

        let frame = match protocol::parse(command) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer, error = %e, command, "Malformed command");
                return Response::error("INVALID_FORMAT");
            }
        };
        trace!(%peer, ?frame, "Dispatching");

        match frame.command {
            "GetDUTInfo" => self.get_dut_info(&frame, peer),
            "GetStatus" => self.get_status(&frame, peer),
            "SetTestResult" => self.set_test_result(&frame, peer),
            "SetSiteTemp" => self.set_site_temp(&frame, peer),
            "GetSiteNo" => {
                let site = protocol::site_from_ip(peer);
                Response::envelope(Some(site), "SITENO", &[("SITENO", &site.to_string())])
            }
            "GetID" => GET_ID.to_string(),
            "GetLotInfo" => self.lot_info.clone(),
            "GetHandlerStatus" => GET_HANDLER_STATUS.to_string(),
            "EnableTempLog" => ENABLE_TEMP_LOG.to_string(),
            "DisableTempLog" => DISABLE_TEMP_LOG.to_string(),
            "EnableTSD" => ENABLE_TSD.to_string(),
            "DisableTSD" => DISABLE_TSD.to_string(),
            other => {
                debug!(%peer, command = other, "Unknown command");
                Response::unknown(other)
            }
        }
    }

    fn get_dut_info(&self, frame: &Frame<'_>, peer: IpAddr) -> String {
        if frame.site == SiteToken::Absent {
            return Response::error("INVALID_FORMAT_NO_SITENO");
        }
        let site = frame.site.resolve(peer);

        let checkout = self.allocations.checkout(peer, &self.pool);
        match checkout.dut() {
            Some(dut) => dut_info(site, dut),
            None => {
                info!(%peer, consumed = self.pool.consumed(), "Lot end reached");
                self.flush_summary();
                Response::envelope(Some(site), "LOTEND", &[("STATUS", "LOT_END")])
            }
        }
    }

    fn get_status(&self, frame: &Frame<'_>, peer: IpAddr) -> String {
        let site = frame.site.resolve(peer);
        let temp = self.temperatures.get(site);

        Response::envelope(
            Some(site),
            "STATUS",
            &[
                ("TEMP", &format_temp(temp)),
                ("TSD", "1"),
                ("CASE_TEMP", &format_temp(temp + CASE_OFFSET)),
                ("JUNCTION_TEMP", &format_temp(temp - JUNCTION_OFFSET)),
                ("DUT_READY", "1"),
                ("ERROR", ""),
            ],
        )
    }

    fn set_test_result(&self, frame: &Frame<'_>, peer: IpAddr) -> String {
        const COMMAND: &str = "SetTestResult";
        let site = protocol::site_from_ip(peer);
        let params = protocol::parse_params(frame.body);

        let (Some(bin), Some(barcode)) = (params.get("BIN"), params.get("BCD")) else {
            return Response::nak(site, COMMAND, "MISSING_PARAMETERS");
        };

        match self.allocations.release_matching(peer, barcode) {
            Release::Released(dut) => {
                self.summary.append(SummaryEntry {
                    site,
                    barcode: dut.barcode.clone(),
                    bin: bin.clone(),
                });
                info!(%peer, site, uid = %dut.uid, barcode = %dut.barcode, bin = %bin, "Test result recorded");
                Response::ack(site, COMMAND)
            }
            Release::Mismatch | Release::NotHeld => {
                warn!(%peer, site, barcode = %barcode, "Result for a DUT the site does not hold");
                Response::nak(site, COMMAND, "INVALID_BCD")
            }
        }
    }

    fn set_site_temp(&self, frame: &Frame<'_>, peer: IpAddr) -> String {
        const COMMAND: &str = "SetSiteTemp";
        let site = frame.site.resolve(peer);
        let payload = frame
            .body
            .rsplit_once('=')
            .map_or(frame.body, |(_, value)| value)
            .trim();

        let temp = match payload.parse::<f64>() {
            Ok(temp) if temp.is_finite() => temp,
            _ => return Response::timeout(site, COMMAND, "INVALID_VALUE"),
        };
        if !(MIN_SITE_TEMP..=MAX_SITE_TEMP).contains(&temp) {
            return Response::nak(site, COMMAND, "OUT_OF_RANGE");
        }

        self.temperatures.set(site, temp);
        Response::envelope(
            Some(site),
            "ACK",
            &[("CMD", COMMAND), ("TEMP", &format_temp(temp))],
        )
    }

    /// Drop the DUT held by `peer`, if any. Called when a session ends.
    pub fn release_peer(&self, peer: IpAddr) -> Option<Arc<DutRecord>> {
        let released = self.allocations.release(peer);
        if let Some(dut) = &released {
            info!(%peer, uid = %dut.uid, "DUT discarded on disconnect");
        }
        released
    }

    /// Persist the summary log. Failures are logged, never propagated.
    pub fn flush_summary(&self) {
        let entries = self.summary.snapshot();
        if let Err(e) = self.writer.write(&entries) {
            error!(path = %self.writer.path().display(), error = %e, "Failed to write summary");
        }
    }

    /// Number of results logged so far
    pub fn results_logged(&self) -> usize {
        self.summary.len()
    }

    /// Number of DUTs currently checked out
    pub fn duts_held(&self) -> usize {
        self.allocations.len()
    }
}

fn dut_info(site: u32, dut: &DutRecord) -> String {
    Response::envelope(
        Some(site),
        "DUTINFO",
        &[
            ("UID", &dut.uid),
            ("BCD", &dut.barcode),
            ("WARPAGE", &format!("{:.3}", dut.warpage)),
            ("TESTCOUNT", &dut.test_count.to_string()),
        ],
    )
}
