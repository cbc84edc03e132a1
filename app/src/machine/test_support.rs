use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::command::CommandBatch;
use crate::core::time::DateTime;
use crate::port::{Capabilities, DeviceId, HistoryReceipt, RemoteError, RemoteService, ServerEvent};
use crate::status::StatusReport;
use crate::switching::SwitchingEvent;

pub struct FakeRemote {
    connected: AtomicBool,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, RemoteError)>>,
    device: DeviceId,
    server_time: Mutex<DateTime>,
    commands: Mutex<CommandBatch>,
    history_receipt: Mutex<HistoryReceipt>,
    histories: Mutex<Vec<Vec<SwitchingEvent>>>,
    statuses: Mutex<Vec<StatusReport>>,
    events: Mutex<Option<mpsc::Sender<ServerEvent>>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            calls: Mutex::new(vec![]),
            failures: Mutex::new(vec![]),
            device: DeviceId::from("dev-1"),
            server_time: Mutex::new(DateTime::from_millis(1_700_000_000_000)),
            commands: Mutex::new(CommandBatch::new()),
            history_receipt: Mutex::new(HistoryReceipt::Accepted),
            histories: Mutex::new(vec![]),
            statuses: Mutex::new(vec![]),
            events: Mutex::new(None),
        }
    }
}

impl FakeRemote {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next(&self, operation: &str) {
        self.fail_next_with(
            operation,
            RemoteError::Transport {
                message: "connection reset".to_string(),
            },
        );
    }

    pub fn fail_next_with(&self, operation: &str, error: RemoteError) {
        self.failures.lock().unwrap().push((operation.to_string(), error));
    }

    pub fn set_server_time(&self, time: DateTime) {
        *self.server_time.lock().unwrap() = time;
    }

    pub fn set_commands(&self, commands: CommandBatch) {
        *self.commands.lock().unwrap() = commands;
    }

    pub fn set_history_receipt(&self, receipt: HistoryReceipt) {
        *self.history_receipt.lock().unwrap() = receipt;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .collect()
    }

    pub fn histories(&self) -> Vec<Vec<SwitchingEvent>> {
        self.histories.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<StatusReport> {
        self.statuses.lock().unwrap().clone()
    }

    pub async fn push(&self, event: ServerEvent) {
        let sender = self.events.lock().unwrap().clone().expect("nobody subscribed");
        sender.send(event).await.unwrap();
    }

    fn record(&self, operation: &str, detail: &str) -> Result<(), RemoteError> {
        let call = if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{} {}", operation, detail)
        };
        self.calls.lock().unwrap().push(call);

        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|(op, _)| op == operation) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }
}

impl RemoteService for FakeRemote {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn authenticate(&self) -> Result<(), RemoteError> {
        self.record("authenticate", "")
    }

    async fn register_capabilities(&self, capabilities: &Capabilities) -> Result<DeviceId, RemoteError> {
        let payload = serde_json::to_string(capabilities).unwrap();
        self.record("register_capabilities", &payload)?;
        Ok(self.device.clone())
    }

    async fn signal_boot(&self, device: &DeviceId) -> Result<(), RemoteError> {
        self.record("signal_boot", device.as_str())
    }

    async fn fetch_time(&self) -> Result<DateTime, RemoteError> {
        self.record("fetch_time", "")?;
        Ok(*self.server_time.lock().unwrap())
    }

    async fn fetch_commands(&self, device: &DeviceId) -> Result<CommandBatch, RemoteError> {
        self.record("fetch_commands", device.as_str())?;
        Ok(self.commands.lock().unwrap().clone())
    }

    async fn send_heartbeat(&self, device: &DeviceId) -> Result<(), RemoteError> {
        self.record("send_heartbeat", device.as_str())
    }

    async fn report_history(
        &self,
        device: &DeviceId,
        history: &[SwitchingEvent],
    ) -> Result<HistoryReceipt, RemoteError> {
        self.record("report_history", device.as_str())?;
        self.histories.lock().unwrap().push(history.to_vec());
        Ok(*self.history_receipt.lock().unwrap())
    }

    async fn report_status(&self, device: &DeviceId, status: &StatusReport) -> Result<(), RemoteError> {
        self.record("report_status", device.as_str())?;
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn subscribe(&self, device: &DeviceId) -> Result<mpsc::Receiver<ServerEvent>, RemoteError> {
        self.record("subscribe", device.as_str())?;
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
