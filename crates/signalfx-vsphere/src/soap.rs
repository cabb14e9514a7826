// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`Gateway`] over the vSphere Web Services SOAP API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quick_xml::escape::escape;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use signalfx_core::errors::ConfigError;

use crate::config::VsphereConfig;
use crate::errors::GatewayError;
use crate::gateway::Gateway;
use crate::model::{
    InventoryObject, ManagedObject, ManagedObjectRef, PerfCounterInfo, PerfEntityMetric,
    PerfMetricId, PerfMetricIntSeries, PerfStatsType, VmProperties, CLUSTER_COMPUTE_TYPE,
    COMPUTE_TYPE, DATACENTER_TYPE, FOLDER_TYPE, HOST_TYPE, REALTIME_INTERVAL_SECS, VM_TYPE,
};
use crate::xml::{self, XmlNode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SOAP_ACTION: &str = "urn:vim25/6.5";

/// References returned by `RetrieveServiceContent`.
#[derive(Debug, Clone, PartialEq)]
struct ServiceContent {
    root_folder: ManagedObjectRef,
    property_collector: ManagedObjectRef,
    perf_manager: ManagedObjectRef,
    session_manager: ManagedObjectRef,
}

pub struct SoapGateway {
    client: reqwest::Client,
    url: String,
    vcenter: String,
    username: String,
    password: String,
    content: Mutex<Option<ServiceContent>>,
    cookie: Mutex<Option<String>>,
}

impl SoapGateway {
    pub fn new(config: &VsphereConfig) -> Result<Self, ConfigError> {
        let client = build_client(config)?;
        Ok(SoapGateway::with_client(
            client,
            config.sdk_url(),
            &config.host,
            &config.username,
            &config.password,
        ))
    }

    pub fn with_client(
        client: reqwest::Client,
        url: String,
        vcenter: &str,
        username: &str,
        password: &str,
    ) -> Self {
        SoapGateway {
            client,
            url,
            vcenter: vcenter.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            content: Mutex::new(None),
            cookie: Mutex::new(None),
        }
    }

    async fn send(&self, operation: &'static str, body: &str) -> Result<XmlNode, GatewayError> {
        let envelope = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
             <soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"
        );
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope);
        if let Some(cookie) = self.cookie.lock().clone() {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|source| GatewayError::Request { operation, source })?;
        let status = response.status();
        if let Some(cookie) = session_cookie(response.headers()) {
            *self.cookie.lock() = Some(cookie);
        }
        let text = response
            .text()
            .await
            .map_err(|source| GatewayError::Request { operation, source })?;

        let document = match xml::parse(&text) {
            Ok(document) => document,
            Err(_) if !status.is_success() => {
                return Err(GatewayError::Status {
                    operation,
                    status: status.as_u16(),
                    body: text,
                })
            }
            Err(e) => return Err(GatewayError::malformed(operation, e.to_string())),
        };

        if let Some(fault) = document.find("Fault") {
            if fault.find("NotAuthenticatedFault").is_some()
                || fault_type(fault) == Some("NotAuthenticated")
            {
                return Err(GatewayError::NotAuthenticated(operation));
            }
            return Err(GatewayError::Fault {
                operation,
                message: fault.child_text("faultstring").unwrap_or_default().to_string(),
            });
        }
        if !status.is_success() {
            return Err(GatewayError::Status {
                operation,
                status: status.as_u16(),
                body: text,
            });
        }

        document
            .path(&["Body", &format!("{operation}Response")])
            .cloned()
            .ok_or_else(|| GatewayError::malformed(operation, "missing response element"))
    }

    /// Sends an authenticated request, logging in again once if the session
    /// has expired.
    async fn invoke(&self, operation: &'static str, body: &str) -> Result<XmlNode, GatewayError> {
        match self.send(operation, body).await {
            Err(GatewayError::NotAuthenticated(_)) => {
                warn!(vcenter = %self.vcenter, "vSphere session expired, logging in again");
                *self.cookie.lock() = None;
                self.login().await?;
                self.send(operation, body).await
            }
            result => result,
        }
    }

    async fn service_content(&self) -> Result<ServiceContent, GatewayError> {
        if let Some(content) = self.content.lock().clone() {
            return Ok(content);
        }
        let operation = "RetrieveServiceContent";
        let response = self
            .send(
                operation,
                "<RetrieveServiceContent xmlns=\"urn:vim25\">\
                 <_this type=\"ServiceInstance\">ServiceInstance</_this>\
                 </RetrieveServiceContent>",
            )
            .await?;
        let value = returnval(operation, &response)?;
        let reference = |name: &str| {
            value
                .child(name)
                .and_then(node_ref)
                .ok_or_else(|| GatewayError::malformed(operation, format!("missing {name}")))
        };
        let content = ServiceContent {
            root_folder: reference("rootFolder")?,
            property_collector: reference("propertyCollector")?,
            perf_manager: reference("perfManager")?,
            session_manager: reference("sessionManager")?,
        };
        *self.content.lock() = Some(content.clone());
        Ok(content)
    }

    async fn login(&self) -> Result<(), GatewayError> {
        let content = self.service_content().await?;
        let body = format!(
            "<Login xmlns=\"urn:vim25\">{}<userName>{}</userName><password>{}</password></Login>",
            this(&content.session_manager),
            escape(self.username.as_str()),
            escape(self.password.as_str()),
        );
        self.send("Login", &body).await?;
        if self.cookie.lock().is_none() {
            return Err(GatewayError::malformed("Login", "no session cookie returned"));
        }
        debug!(vcenter = %self.vcenter, "Logged in to vSphere");
        Ok(())
    }

    /// Reads `properties` of one object into a property name to value map.
    async fn retrieve_properties(
        &self,
        reference: &ManagedObjectRef,
        properties: &[&str],
    ) -> Result<Vec<(String, XmlNode)>, GatewayError> {
        let operation = "RetrievePropertiesEx";
        let content = self.service_content().await?;
        let mut body = format!(
            "<RetrievePropertiesEx xmlns=\"urn:vim25\">{}<specSet><propSet><type>{}</type>",
            this(&content.property_collector),
            escape(reference.object_type.as_str()),
        );
        for property in properties {
            let _ = write!(body, "<pathSet>{property}</pathSet>");
        }
        let _ = write!(
            body,
            "</propSet><objectSet>{}<skip>false</skip></objectSet></specSet><options/>\
             </RetrievePropertiesEx>",
            ref_element("obj", reference),
        );

        let response = self.invoke(operation, &body).await?;
        let objects = returnval(operation, &response)?
            .child("objects")
            .ok_or_else(|| GatewayError::malformed(operation, format!("{reference} not found")))?;
        Ok(objects
            .children_named("propSet")
            .filter_map(|prop| {
                let name = prop.child_text("name")?;
                Some((name.to_string(), prop.child("val")?.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl Gateway for SoapGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        *self.content.lock() = None;
        *self.cookie.lock() = None;
        self.login().await
    }

    async fn disconnect(&self) {
        let Some(content) = self.content.lock().clone() else {
            return;
        };
        if self.cookie.lock().is_none() {
            return;
        }
        let body = format!(
            "<Logout xmlns=\"urn:vim25\">{}</Logout>",
            this(&content.session_manager)
        );
        if let Err(e) = self.send("Logout", &body).await {
            debug!(vcenter = %self.vcenter, "Logout failed: {e}");
        }
        *self.cookie.lock() = None;
    }

    async fn retrieve_perf_counters(&self) -> Result<Vec<PerfCounterInfo>, GatewayError> {
        let content = self.service_content().await?;
        let props = self
            .retrieve_properties(&content.perf_manager, &["perfCounter"])
            .await?;
        let Some((_, counters)) = props.iter().find(|(name, _)| name == "perfCounter") else {
            return Ok(Vec::new());
        };
        Ok(counters
            .children_named("PerfCounterInfo")
            .filter_map(parse_counter)
            .collect())
    }

    async fn root_folder(&self) -> Result<ManagedObjectRef, GatewayError> {
        Ok(self.service_content().await?.root_folder)
    }

    async fn retrieve_object(
        &self,
        reference: &ManagedObjectRef,
    ) -> Result<ManagedObject, GatewayError> {
        let properties: &[&str] = match reference.object_type.as_str() {
            FOLDER_TYPE => &["childEntity"],
            DATACENTER_TYPE => &["name", "hostFolder"],
            CLUSTER_COMPUTE_TYPE | COMPUTE_TYPE => &["name", "host"],
            HOST_TYPE => &["name", "vm"],
            VM_TYPE => &[
                "name",
                "config.guestId",
                "guest.ipAddress",
                "guest.guestFamily",
                "guest.guestFullName",
            ],
            other => return Err(GatewayError::UnsupportedType(other.to_string())),
        };
        let props = self.retrieve_properties(reference, properties).await?;
        let text = |name: &str| {
            props
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.text.clone())
                .unwrap_or_default()
        };
        let refs = |name: &str| {
            props
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| ref_array(v))
                .unwrap_or_default()
        };

        Ok(match reference.object_type.as_str() {
            FOLDER_TYPE => ManagedObject::Folder {
                child_entity: refs("childEntity"),
            },
            DATACENTER_TYPE => ManagedObject::Datacenter {
                name: text("name"),
                host_folder: props
                    .iter()
                    .find(|(n, _)| n == "hostFolder")
                    .and_then(|(_, v)| node_ref(v))
                    .ok_or_else(|| {
                        GatewayError::malformed(
                            "RetrievePropertiesEx",
                            "datacenter without hostFolder",
                        )
                    })?,
            },
            CLUSTER_COMPUTE_TYPE => ManagedObject::ClusterComputeResource {
                name: text("name"),
                hosts: refs("host"),
            },
            COMPUTE_TYPE => ManagedObject::ComputeResource {
                name: text("name"),
                hosts: refs("host"),
            },
            HOST_TYPE => ManagedObject::HostSystem {
                name: text("name"),
                vms: refs("vm"),
            },
            _ => ManagedObject::VirtualMachine(VmProperties {
                name: text("name"),
                guest_id: text("config.guestId"),
                ip_address: text("guest.ipAddress"),
                guest_family: text("guest.guestFamily"),
                guest_full_name: text("guest.guestFullName"),
            }),
        })
    }

    async fn query_available_perf_metric(
        &self,
        reference: &ManagedObjectRef,
    ) -> Result<Vec<PerfMetricId>, GatewayError> {
        let content = self.service_content().await?;
        let body = format!(
            "<QueryAvailablePerfMetric xmlns=\"urn:vim25\">{}{}\
             <intervalId>{REALTIME_INTERVAL_SECS}</intervalId></QueryAvailablePerfMetric>",
            this(&content.perf_manager),
            ref_element("entity", reference),
        );
        let response = self.invoke("QueryAvailablePerfMetric", &body).await?;
        Ok(response
            .children_named("returnval")
            .filter_map(parse_metric_id)
            .collect())
    }

    async fn query_perf(
        &self,
        objects: &[InventoryObject],
        max_sample: i32,
    ) -> Result<Vec<PerfEntityMetric>, GatewayError> {
        let operation = "QueryPerf";
        let content = self.service_content().await?;
        let mut body = format!(
            "<QueryPerf xmlns=\"urn:vim25\">{}",
            this(&content.perf_manager)
        );
        for object in objects {
            let _ = write!(
                body,
                "<querySpec>{}<maxSample>{max_sample}</maxSample>",
                ref_element("entity", &object.reference),
            );
            for id in &object.metric_ids {
                let _ = write!(
                    body,
                    "<metricId><counterId>{}</counterId><instance>{}</instance></metricId>",
                    id.counter_id,
                    escape(id.instance.as_str()),
                );
            }
            let _ = write!(
                body,
                "<intervalId>{REALTIME_INTERVAL_SECS}</intervalId></querySpec>"
            );
        }
        body.push_str("</QueryPerf>");

        let response = self.invoke(operation, &body).await?;
        response
            .children_named("returnval")
            .map(|entity| parse_entity_metric(operation, entity))
            .collect()
    }

    async fn current_time(&self) -> Result<DateTime<Utc>, GatewayError> {
        let operation = "CurrentTime";
        let response = self
            .invoke(
                operation,
                "<CurrentTime xmlns=\"urn:vim25\">\
                 <_this type=\"ServiceInstance\">ServiceInstance</_this></CurrentTime>",
            )
            .await?;
        parse_time(operation, &returnval(operation, &response)?.text)
    }

    fn vcenter_name(&self) -> &str {
        &self.vcenter
    }
}

fn build_client(config: &VsphereConfig) -> Result<reqwest::Client, ConfigError> {
    config.validate()?;
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(config.insecure_skip_verify);

    if let Some(ca) = &config.tls_ca_cert_path {
        let pem = std::fs::read(ca)?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| ConfigError::invalid("tlsCACertPath", e.to_string()))?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(cert), Some(key)) = (
        &config.tls_client_certificate_path,
        &config.tls_client_key_path,
    ) {
        builder = builder.identity(read_identity(cert, key)?);
    }

    builder
        .build()
        .map_err(|e| ConfigError::invalid("host", e.to_string()))
}

fn read_identity(cert: &Path, key: &Path) -> Result<reqwest::Identity, ConfigError> {
    let mut pem = std::fs::read(cert)?;
    pem.push(b'\n');
    pem.extend(std::fs::read(key)?);
    reqwest::Identity::from_pem(&pem)
        .map_err(|e| ConfigError::invalid("tlsClientCertificatePath", e.to_string()))
}

/// The `name=value` part of the vSphere session cookie.
fn session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .find(|v| v.trim_start().starts_with("vmware_soap_session"))
        .map(|v| v.trim().to_string())
}

fn this(reference: &ManagedObjectRef) -> String {
    ref_element("_this", reference)
}

fn ref_element(tag: &str, reference: &ManagedObjectRef) -> String {
    format!(
        "<{tag} type=\"{}\">{}</{tag}>",
        escape(reference.object_type.as_str()),
        escape(reference.value.as_str()),
    )
}

fn node_ref(node: &XmlNode) -> Option<ManagedObjectRef> {
    let object_type = node.attribute("type")?;
    Some(ManagedObjectRef::new(object_type, node.text.clone()))
}

fn ref_array(node: &XmlNode) -> Vec<ManagedObjectRef> {
    node.children_named("ManagedObjectReference")
        .filter_map(node_ref)
        .collect()
}

fn fault_type(fault: &XmlNode) -> Option<&str> {
    fault
        .child("detail")?
        .children
        .first()?
        .attribute("xsi:type")
        .map(|t| t.trim_end_matches("Fault"))
}

fn returnval<'a>(
    operation: &'static str,
    response: &'a XmlNode,
) -> Result<&'a XmlNode, GatewayError> {
    response
        .child("returnval")
        .ok_or_else(|| GatewayError::malformed(operation, "missing returnval"))
}

fn parse_counter(node: &XmlNode) -> Option<PerfCounterInfo> {
    Some(PerfCounterInfo {
        key: node.child_text("key")?.parse().ok()?,
        group_key: node.path(&["groupInfo", "key"])?.text.clone(),
        name_key: node.path(&["nameInfo", "key"])?.text.clone(),
        stats_type: PerfStatsType::parse(node.child_text("statsType")?)?,
    })
}

fn parse_metric_id(node: &XmlNode) -> Option<PerfMetricId> {
    Some(PerfMetricId {
        counter_id: node.child_text("counterId")?.parse().ok()?,
        instance: node.child_text("instance").unwrap_or_default().to_string(),
    })
}

fn parse_time(operation: &'static str, text: &str) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::malformed(operation, format!("bad time {text:?}: {e}")))
}

fn parse_entity_metric(
    operation: &'static str,
    node: &XmlNode,
) -> Result<PerfEntityMetric, GatewayError> {
    let entity = node
        .child("entity")
        .and_then(node_ref)
        .ok_or_else(|| GatewayError::malformed(operation, "metric without entity"))?;
    let sample_times = node
        .children_named("sampleInfo")
        .map(|info| parse_time(operation, info.child_text("timestamp").unwrap_or_default()))
        .collect::<Result<Vec<_>, _>>()?;
    let mut series = Vec::new();
    for values_node in node.children_named("value") {
        let Some(id) = values_node.child("id").and_then(parse_metric_id) else {
            continue;
        };
        // Values line up with sample_times by position.
        let values = values_node
            .children_named("value")
            .map(|v| {
                v.text.trim().parse::<i64>().map_err(|e| {
                    GatewayError::malformed(
                        operation,
                        format!("bad value {:?} for counter {}: {e}", v.text, id.counter_id),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        series.push(PerfMetricIntSeries { id, values });
    }
    Ok(PerfEntityMetric {
        entity,
        sample_times,
        series,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    const SERVICE_CONTENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body><RetrieveServiceContentResponse xmlns="urn:vim25"><returnval>
<rootFolder type="Folder">group-d1</rootFolder>
<propertyCollector type="PropertyCollector">propertyCollector</propertyCollector>
<sessionManager type="SessionManager">SessionManager</sessionManager>
<perfManager type="PerformanceManager">PerfMgr</perfManager>
</returnval></RetrieveServiceContentResponse></soapenv:Body></soapenv:Envelope>"#;

    fn envelope(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
             <soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"
        )
    }

    fn gateway(server: &ServerGuard) -> SoapGateway {
        SoapGateway::with_client(
            reqwest::Client::new(),
            format!("{}/sdk", server.url()),
            "vcenter.local",
            "admin",
            "p&ss",
        )
    }

    async fn mock_login(
        server: &mut ServerGuard,
        logins: usize,
    ) -> (mockito::Mock, mockito::Mock) {
        let content = server
            .mock("POST", "/sdk")
            .match_body(Matcher::Regex("RetrieveServiceContent".into()))
            .with_body(SERVICE_CONTENT)
            .create_async()
            .await;
        let login = server
            .mock("POST", "/sdk")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<Login ".into()),
                Matcher::Regex("<password>p&amp;ss</password>".into()),
            ]))
            .with_header("set-cookie", "vmware_soap_session=\"abc\"; Path=/; HttpOnly")
            .expect(logins)
            .with_body(envelope(
                "<LoginResponse xmlns=\"urn:vim25\">\
                 <returnval><key>k</key></returnval></LoginResponse>",
            ))
            .create_async()
            .await;
        (content, login)
    }

    #[tokio::test]
    async fn test_connect_keeps_session_cookie() {
        let mut server = Server::new_async().await;
        let (content, login) = mock_login(&mut server, 1).await;
        let time = server
            .mock("POST", "/sdk")
            .match_header("cookie", "vmware_soap_session=\"abc\"")
            .match_body(Matcher::Regex("<CurrentTime ".into()))
            .with_body(envelope(
                "<CurrentTimeResponse xmlns=\"urn:vim25\">\
                 <returnval>2024-01-01T00:00:20.5Z</returnval></CurrentTimeResponse>",
            ))
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();
        let now = gw.current_time().await.unwrap();
        assert_eq!(now.to_rfc3339(), "2024-01-01T00:00:20.500+00:00");
        assert_eq!(
            gw.root_folder().await.unwrap(),
            ManagedObjectRef::new(FOLDER_TYPE, "group-d1")
        );
        assert_eq!(gw.vcenter_name(), "vcenter.local");

        content.assert_async().await;
        login.assert_async().await;
        time.assert_async().await;
    }

    #[tokio::test]
    async fn test_retrieve_host_and_vm() {
        let mut server = Server::new_async().await;
        mock_login(&mut server, 1).await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<RetrievePropertiesEx ".into()),
                Matcher::Regex(r#"<obj type="HostSystem">host-1</obj>"#.into()),
            ]))
            .with_body(envelope(
                r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="HostSystem">host-1</obj>
<propSet><name>name</name><val xsi:type="xsd:string">10.0.0.1</val></propSet>
<propSet><name>vm</name><val xsi:type="ArrayOfManagedObjectReference">
<ManagedObjectReference type="VirtualMachine" xsi:type="ManagedObjectReference">vm-1</ManagedObjectReference>
<ManagedObjectReference type="VirtualMachine" xsi:type="ManagedObjectReference">vm-2</ManagedObjectReference>
</val></propSet>
</objects></returnval></RetrievePropertiesExResponse>"#,
            ))
            .create_async()
            .await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<RetrievePropertiesEx ".into()),
                Matcher::Regex(r#"<obj type="VirtualMachine">vm-1</obj>"#.into()),
            ]))
            .with_body(envelope(
                r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="VirtualMachine">vm-1</obj>
<propSet><name>config.guestId</name><val xsi:type="xsd:string">debian10_64Guest</val></propSet>
<propSet><name>guest.guestFamily</name><val xsi:type="xsd:string">linuxGuest</val></propSet>
<propSet><name>name</name><val xsi:type="xsd:string">web-1</val></propSet>
</objects></returnval></RetrievePropertiesExResponse>"#,
            ))
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();

        let host = gw
            .retrieve_object(&ManagedObjectRef::new(HOST_TYPE, "host-1"))
            .await
            .unwrap();
        assert_eq!(
            host,
            ManagedObject::HostSystem {
                name: "10.0.0.1".into(),
                vms: vec![
                    ManagedObjectRef::new(VM_TYPE, "vm-1"),
                    ManagedObjectRef::new(VM_TYPE, "vm-2"),
                ],
            }
        );

        let vm = gw
            .retrieve_object(&ManagedObjectRef::new(VM_TYPE, "vm-1"))
            .await
            .unwrap();
        assert_eq!(
            vm,
            ManagedObject::VirtualMachine(VmProperties {
                name: "web-1".into(),
                guest_id: "debian10_64Guest".into(),
                ip_address: String::new(),
                guest_family: "linuxGuest".into(),
                guest_full_name: String::new(),
            })
        );

        assert!(matches!(
            gw.retrieve_object(&ManagedObjectRef::new("Network", "network-1"))
                .await,
            Err(GatewayError::UnsupportedType(_))
        ));
    }

    #[tokio::test]
    async fn test_perf_counters_and_available_metrics() {
        let mut server = Server::new_async().await;
        mock_login(&mut server, 1).await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::Regex("<pathSet>perfCounter</pathSet>".into()))
            .with_body(envelope(
                r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="PerformanceManager">PerfMgr</obj>
<propSet><name>perfCounter</name><val xsi:type="ArrayOfPerfCounterInfo">
<PerfCounterInfo><key>2</key><nameInfo><label>Usage</label><key>usage</key></nameInfo>
<groupInfo><label>CPU</label><key>cpu</key></groupInfo><unitInfo><key>percent</key></unitInfo>
<rollupType>average</rollupType><statsType>rate</statsType></PerfCounterInfo>
<PerfCounterInfo><key>6</key><nameInfo><key>usagemhz</key></nameInfo>
<groupInfo><key>cpu</key></groupInfo><statsType>bogus</statsType></PerfCounterInfo>
</val></propSet>
</objects></returnval></RetrievePropertiesExResponse>"#,
            ))
            .create_async()
            .await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<QueryAvailablePerfMetric ".into()),
                Matcher::Regex("<intervalId>20</intervalId>".into()),
            ]))
            .with_body(envelope(
                r#"<QueryAvailablePerfMetricResponse xmlns="urn:vim25">
<returnval><counterId>2</counterId><instance></instance></returnval>
<returnval><counterId>6</counterId><instance>0</instance></returnval>
</QueryAvailablePerfMetricResponse>"#,
            ))
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();

        let counters = gw.retrieve_perf_counters().await.unwrap();
        assert_eq!(
            counters,
            vec![PerfCounterInfo {
                key: 2,
                group_key: "cpu".into(),
                name_key: "usage".into(),
                stats_type: PerfStatsType::Rate,
            }]
        );

        let ids = gw
            .query_available_perf_metric(&ManagedObjectRef::new(HOST_TYPE, "host-1"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1].counter_id, 6);
        assert_eq!(ids[1].instance, "0");
    }

    #[tokio::test]
    async fn test_query_perf() {
        let mut server = Server::new_async().await;
        mock_login(&mut server, 1).await;
        let query = server
            .mock("POST", "/sdk")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("<QueryPerf ".into()),
                Matcher::Regex("<maxSample>2</maxSample>".into()),
                Matcher::Regex(
                    "<metricId><counterId>2</counterId><instance></instance></metricId>".into(),
                ),
            ]))
            .with_body(envelope(
                r#"<QueryPerfResponse xmlns="urn:vim25"><returnval xsi:type="PerfEntityMetric">
<entity type="HostSystem">host-1</entity>
<sampleInfo><timestamp>2024-01-01T00:00:00Z</timestamp><interval>20</interval></sampleInfo>
<sampleInfo><timestamp>2024-01-01T00:00:20Z</timestamp><interval>20</interval></sampleInfo>
<value xsi:type="PerfMetricIntSeries"><id><counterId>2</counterId><instance></instance></id>
<value>4250</value><value>4300</value></value>
</returnval></QueryPerfResponse>"#,
            ))
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();

        let mut object = InventoryObject::new(
            ManagedObjectRef::new(HOST_TYPE, "host-1"),
            Default::default(),
        );
        object.metric_ids = vec![PerfMetricId {
            counter_id: 2,
            instance: String::new(),
        }];
        let metrics = gw.query_perf(&[object], 2).await.unwrap();
        query.assert_async().await;

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].entity.value, "host-1");
        assert_eq!(metrics[0].sample_times.len(), 2);
        assert_eq!(metrics[0].series[0].values, vec![4250, 4300]);
    }

    #[tokio::test]
    async fn test_query_perf_rejects_unparseable_value() {
        let mut server = Server::new_async().await;
        mock_login(&mut server, 1).await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::Regex("<QueryPerf ".into()))
            .with_body(envelope(
                r#"<QueryPerfResponse xmlns="urn:vim25"><returnval xsi:type="PerfEntityMetric">
<entity type="HostSystem">host-1</entity>
<sampleInfo><timestamp>2024-01-01T00:00:00Z</timestamp><interval>20</interval></sampleInfo>
<sampleInfo><timestamp>2024-01-01T00:00:20Z</timestamp><interval>20</interval></sampleInfo>
<value xsi:type="PerfMetricIntSeries"><id><counterId>2</counterId><instance></instance></id>
<value>n/a</value><value>4300</value></value>
</returnval></QueryPerfResponse>"#,
            ))
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();
        let mut object = InventoryObject::new(
            ManagedObjectRef::new(HOST_TYPE, "host-1"),
            Default::default(),
        );
        object.metric_ids = vec![PerfMetricId {
            counter_id: 2,
            instance: String::new(),
        }];
        match gw.query_perf(&[object], 2).await {
            Err(GatewayError::Malformed { operation, reason }) => {
                assert_eq!(operation, "QueryPerf");
                assert!(reason.contains("n/a"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fault_and_status_errors() {
        let mut server = Server::new_async().await;
        mock_login(&mut server, 1).await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::Regex("<CurrentTime ".into()))
            .with_status(500)
            .with_body(envelope(
                "<soapenv:Fault><faultcode>ServerFaultCode</faultcode>\
                 <faultstring>The object has already been deleted</faultstring>\
                 <detail><ManagedObjectNotFoundFault xsi:type=\"ManagedObjectNotFound\"/></detail>\
                 </soapenv:Fault>",
            ))
            .create_async()
            .await;
        server
            .mock("POST", "/sdk")
            .match_body(Matcher::Regex("<QueryAvailablePerfMetric ".into()))
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();
        match gw.current_time().await {
            Err(GatewayError::Fault { operation, message }) => {
                assert_eq!(operation, "CurrentTime");
                assert_eq!(message, "The object has already been deleted");
            }
            other => panic!("unexpected result {other:?}"),
        }
        match gw
            .query_available_perf_metric(&ManagedObjectRef::new(HOST_TYPE, "host-1"))
            .await
        {
            Err(GatewayError::Status { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_session_logs_in_again() {
        let mut server = Server::new_async().await;
        let (_content, login) = mock_login(&mut server, 2).await;
        let expired = server
            .mock("POST", "/sdk")
            .match_body(Matcher::Regex("<CurrentTime ".into()))
            .with_status(500)
            .with_body(envelope(
                "<soapenv:Fault><faultcode>ServerFaultCode</faultcode>\
                 <faultstring>The session is not authenticated.</faultstring>\
                 <detail><NotAuthenticatedFault xsi:type=\"NotAuthenticated\"/></detail>\
                 </soapenv:Fault>",
            ))
            .expect(2)
            .create_async()
            .await;

        let gw = gateway(&server);
        gw.connect().await.unwrap();
        assert!(matches!(
            gw.current_time().await,
            Err(GatewayError::NotAuthenticated("CurrentTime"))
        ));
        expired.assert_async().await;
        login.assert_async().await;
    }

    #[test]
    fn test_session_cookie() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.append(SET_COOKIE, "other=1; Path=/".parse().unwrap());
        headers.append(
            SET_COOKIE,
            "vmware_soap_session=\"52a\"; Path=/; HttpOnly; Secure".parse().unwrap(),
        );
        assert_eq!(
            session_cookie(&headers).as_deref(),
            Some("vmware_soap_session=\"52a\"")
        );
        assert_eq!(session_cookie(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn test_client_requires_valid_config() {
        assert!(SoapGateway::new(&VsphereConfig::default()).is_err());
        let config = VsphereConfig {
            host: "vcenter.local".into(),
            tls_ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(SoapGateway::new(&config), Err(ConfigError::Io(_))));
        let config = VsphereConfig {
            host: "vcenter.local".into(),
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(SoapGateway::new(&config).is_ok());
    }
}
