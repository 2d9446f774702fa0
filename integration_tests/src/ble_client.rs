//! BLE client for driving the calculator service on a flashed device.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

/// The calculator characteristic identities of one deployment variant
pub struct UuidSet {
    pub service: Uuid,
    pub operand1: Uuid,
    pub operand2: Uuid,
    pub operator: Uuid,
    pub result: Uuid,
}

/// Foreground calculator service UUIDs
pub const FOREGROUND: UuidSet = UuidSet {
    service: Uuid::from_u128(0xcaecface_e1d9_11e6_bf01_fe55135034f0),
    operand1: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f1),
    operand2: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f2),
    operator: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f3),
    result: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f4),
};

/// Background calculator service UUIDs
pub const BACKGROUND: UuidSet = UuidSet {
    service: Uuid::from_u128(0xcaecface_e1d9_11e6_bf01_fe55135034f5),
    operand1: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f6),
    operand2: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f7),
    operator: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f8),
    result: Uuid::from_u128(0xcaec2ebc_e1d9_11e6_bf01_fe55135034f9),
};

/// BLE client bound to one calculator service variant on one device.
pub struct CalculatorClient {
    peripheral: Peripheral,
    operand1_char: Characteristic,
    operand2_char: Characteristic,
    operator_char: Characteristic,
    result_char: Characteristic,
    /// Result values received as notifications, oldest first
    notifications: Arc<Mutex<Vec<i32>>>,
}

impl CalculatorClient {
    /// Scan for a device whose name starts with `prefix` and connect to the
    /// given service variant.
    pub async fn connect_by_prefix(prefix: &str, uuids: &UuidSet, scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        // Start scanning
        adapter.start_scan(ScanFilter::default()).await?;

        // Wait for the device to appear
        let peripheral = Self::find_device_by_prefix(&adapter, prefix, scan_timeout).await?;

        adapter.stop_scan().await?;

        // Connect to the device
        peripheral.connect().await?;

        // Discover services
        peripheral.discover_services().await?;

        // Find the four calculator characteristics
        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid, name: &str| -> Result<Characteristic> {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| anyhow!("{} characteristic not found", name))
        };

        let operand1_char = find(uuids.operand1, "Operand1")?;
        let operand2_char = find(uuids.operand2, "Operand2")?;
        let operator_char = find(uuids.operator, "Operator")?;
        let result_char = find(uuids.result, "Result")?;

        // Subscribe to notifications on the Result characteristic
        peripheral.subscribe(&result_char).await?;

        let notifications = Arc::new(Mutex::new(Vec::new()));

        // Spawn notification handler
        let buffer_clone = notifications.clone();
        let peripheral_clone = peripheral.clone();
        let result_uuid = uuids.result;
        tokio::spawn(async move {
            let mut stream = match peripheral_clone.notifications().await {
                Ok(s) => s,
                Err(_) => return,
            };

            while let Some(data) = stream.next().await {
                if data.uuid == result_uuid && data.value.len() == 4 {
                    let value = i32::from_le_bytes([
                        data.value[0],
                        data.value[1],
                        data.value[2],
                        data.value[3],
                    ]);
                    let mut buf = buffer_clone.lock().await;
                    buf.push(value);
                }
            }
        });

        Ok(Self {
            peripheral,
            operand1_char,
            operand2_char,
            operator_char,
            result_char,
            notifications,
        })
    }

    /// Find a device whose advertised name starts with `prefix`.
    async fn find_device_by_prefix(
        adapter: &Adapter,
        prefix: &str,
        scan_timeout: Duration,
    ) -> Result<Peripheral> {
        let start = std::time::Instant::now();

        while start.elapsed() < scan_timeout {
            let peripherals = adapter.peripherals().await?;

            for peripheral in peripherals {
                if let Some(props) = peripheral.properties().await? {
                    if let Some(local_name) = props.local_name {
                        if local_name.starts_with(prefix) {
                            return Ok(peripheral);
                        }
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(anyhow!("No device matching '{}' found within timeout", prefix))
    }

    /// Write the first operand.
    pub async fn write_operand1(&self, value: i32, with_response: bool) -> Result<()> {
        self.write_raw(&self.operand1_char, &value.to_le_bytes(), with_response)
            .await
    }

    /// Write the second operand.
    pub async fn write_operand2(&self, value: i32, with_response: bool) -> Result<()> {
        self.write_raw(&self.operand2_char, &value.to_le_bytes(), with_response)
            .await
    }

    /// Write the operator code.
    pub async fn write_operator(&self, value: i32, with_response: bool) -> Result<()> {
        self.write_raw(&self.operator_char, &value.to_le_bytes(), with_response)
            .await
    }

    /// Write arbitrary bytes to an input characteristic.
    ///
    /// Used to exercise payload-length validation; the device answers
    /// malformed write requests with an ATT error, which surfaces here as
    /// an `Err`.
    pub async fn write_raw(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, payload, write_type)
            .await?;
        Ok(())
    }

    /// Characteristic handle for raw writes
    pub fn operand1_char(&self) -> &Characteristic {
        &self.operand1_char
    }

    /// Characteristic handle for raw writes
    pub fn operator_char(&self) -> &Characteristic {
        &self.operator_char
    }

    /// Read the current result value.
    pub async fn read_result(&self) -> Result<i32> {
        let bytes = self.peripheral.read(&self.result_char).await?;
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Result payload was {} bytes, expected 4", bytes.len()))?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Drop any buffered notifications.
    pub async fn clear_notifications(&self) {
        self.notifications.lock().await.clear();
    }

    /// Wait for the next result notification.
    pub async fn wait_for_notification(&self, wait: Duration) -> Result<i32> {
        let result = timeout(wait, async {
            loop {
                {
                    let mut buf = self.notifications.lock().await;
                    if !buf.is_empty() {
                        return buf.remove(0);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        result.map_err(|_| anyhow!("Timeout waiting for result notification"))
    }

    /// Check that no notification arrives within the window.
    pub async fn expect_no_notification(&self, wait: Duration) -> Result<()> {
        match timeout(wait, async {
            loop {
                {
                    let buf = self.notifications.lock().await;
                    if !buf.is_empty() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        {
            Ok(()) => Err(anyhow!("Unexpected result notification received")),
            Err(_) => Ok(()),
        }
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
