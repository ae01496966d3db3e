use clap::{Args, Subcommand};
use reqwest::Method;
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

mod gherkin;
mod payload;
mod reconcile;
mod util;

use payload::{CreateTestCaseArgs, TestScript, build_create_payload, build_update_payload};
pub use reconcile::DeploymentVariant;
use reconcile::{MembershipUpdate, cloud_membership_payload, merge_run_items};
use util::{client, resolve_token};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "zephyr-mcp";
const DEFAULT_FOLDER_TYPE: &str = "TEST_CASE";
const FOLDER_TYPES: [&str; 3] = ["TEST_CASE", "TEST_PLAN", "TEST_RUN"];
const DEFAULT_SEARCH_MAX_RESULTS: u64 = 100;
/// How many execution ids to echo per run in exhausted-search diagnostics.
const SEARCH_DIAGNOSTIC_ID_LIMIT: usize = 5;

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the Zephyr Scale MCP server over stdio
    Serve(McpServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// Disable auth header injection (useful behind auth proxies)
    #[arg(long)]
    pub no_auth: bool,
    /// Explicit bearer token override (otherwise ZEPHYR_API_TOKEN or the stored credentials file)
    #[arg(long, env = "ZEPHYR_MCP_TOKEN")]
    pub token: Option<String>,
    /// Deployment variant of the target platform; fixed for the process lifetime
    #[arg(long, env = "ZEPHYR_DEPLOYMENT", value_enum, default_value = "datacenter")]
    pub deployment: DeploymentVariant,
}

pub async fn run(base_url: &str, inherited_no_auth: bool, command: McpCommands) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let mut server = McpServer::new(McpRuntimeConfig {
                base_url: base_url.to_string(),
                deployment: args.deployment,
                no_auth: inherited_no_auth || args.no_auth,
                explicit_token: args.token,
            });
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct McpRuntimeConfig {
    base_url: String,
    deployment: DeploymentVariant,
    explicit_token: Option<String>,
    no_auth: bool,
}

/// REST endpoint roots, derived once from the deployment variant.
#[derive(Clone, Copy, Debug)]
struct ApiEndpoints {
    testcase: &'static str,
    testrun: &'static str,
    folder: &'static str,
    search: &'static str,
}

impl ApiEndpoints {
    fn for_variant(variant: DeploymentVariant) -> Self {
        match variant {
            DeploymentVariant::Datacenter => Self {
                testcase: "/rest/atm/1.0/testcase",
                testrun: "/rest/atm/1.0/testrun",
                folder: "/rest/atm/1.0/folder",
                search: "/rest/atm/1.0/testcase/search",
            },
            DeploymentVariant::Cloud => Self {
                testcase: "/v2/testcases",
                testrun: "/v2/testruns",
                folder: "/v2/folders",
                search: "/v2/testcases/search",
            },
        }
    }
}

struct McpServer {
    config: McpRuntimeConfig,
    endpoints: ApiEndpoints,
    http: reqwest::Client,
    session_id: String,
}

impl McpServer {
    fn new(config: McpRuntimeConfig) -> Self {
        let endpoints = ApiEndpoints::for_variant(config.deployment);
        Self {
            config,
            endpoints,
            http: client(),
            session_id: format!("stdio-{}", Uuid::now_v7()),
        }
    }

    async fn serve_stdio(&mut self) -> Result<(), String> {
        self.emit_startup_status();

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    fn emit_startup_status(&self) {
        let payload = json!({
            "event": "mcp_server_started",
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "deployment": self.config.deployment.as_str(),
            "base_url": self.config.base_url,
            "session_id": self.session_id,
        });
        eprintln!("{}", to_pretty_json(&payload));
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; server does not issue outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method, params).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let instructions = format!(
            "Tools operate on a Zephyr Scale {} deployment. New test cases are always created with status Draft. zephyr_update_test_case_bdd rewrites the test script from Given/When/Then markdown and preserves all other fields of the test case. zephyr_add_test_cases_to_run is idempotent: keys already in the run are never duplicated and existing members are preserved.",
            self.config.deployment.as_str()
        );
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions
        })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        Ok(match self.execute_tool(name, &args).await {
            Ok(text) => json!({
                "content": [{ "type": "text", "text": text }]
            }),
            Err(err) => {
                eprintln!(
                    "{}",
                    to_pretty_json(&json!({
                        "event": "tool_error",
                        "tool": name,
                        "session_id": self.session_id,
                        "error": err.to_value(),
                    }))
                );
                json!({
                    "isError": true,
                    "content": [{ "type": "text", "text": err.message }]
                })
            }
        })
    }

    async fn execute_tool(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        match tool_name {
            "zephyr_get_test_case" => self.tool_get_test_case(args).await,
            "zephyr_create_test_case" => self.tool_create_test_case(args).await,
            "zephyr_update_test_case_bdd" => self.tool_update_test_case_bdd(args).await,
            "zephyr_delete_test_case" => self.tool_delete_test_case(args).await,
            "zephyr_create_folder" => self.tool_create_folder(args).await,
            "zephyr_create_test_run" => self.tool_create_test_run(args).await,
            "zephyr_get_test_run" => self.tool_get_test_run(args).await,
            "zephyr_get_test_run_cases" => self.tool_get_test_run_cases(args).await,
            "zephyr_get_test_execution" => self.tool_get_test_execution(args).await,
            "zephyr_search_test_cases_by_folder" => {
                self.tool_search_test_cases_by_folder(args).await
            }
            "zephyr_add_test_cases_to_run" => self.tool_add_test_cases_to_run(args).await,
            _ => Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool '{tool_name}'"),
            )),
        }
    }

    async fn tool_get_test_case(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let key = required_string(args, "test_case_key")?;
        let path = format!("{}/{key}", self.endpoints.testcase);

        let response = self.send_api_request(Method::GET, &path, &[], None).await?;
        if !response.is_success() {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to get test case: {}",
                    http_error_message(&response)
                ),
            ));
        }
        Ok(to_pretty_json(&response.body))
    }

    async fn tool_create_test_case(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        // 'status' is accepted for schema compatibility but not forwarded;
        // new test cases always enter Draft.
        arg_optional_string(args, "status")?;
        let create_args = CreateTestCaseArgs {
            project_key: required_string(args, "project_key")?,
            name: required_string(args, "name")?,
            test_script: match args.get("test_script") {
                None | Some(Value::Null) => None,
                Some(value) => Some(TestScript::from_args(value)?),
            },
            folder: arg_optional_string(args, "folder")?,
            priority: arg_optional_string(args, "priority")?,
            precondition: arg_optional_string(args, "precondition")?,
            objective: arg_optional_string(args, "objective")?,
            component: arg_optional_string(args, "component")?,
            owner: arg_optional_string(args, "owner")?,
            estimated_time: arg_optional_u64(args, "estimated_time")?,
            labels: arg_optional_string_array(args, "labels")?,
            issue_links: arg_optional_string_array(args, "issue_links")?,
            custom_fields: arg_optional_object(args, "custom_fields")?,
            parameters: arg_optional_object(args, "parameters")?,
        };
        let script_type = create_args
            .test_script
            .as_ref()
            .map(TestScript::type_tag)
            .unwrap_or("none");
        let payload = build_create_payload(&create_args);

        let response = self
            .send_api_request(Method::POST, self.endpoints.testcase, &[], Some(payload))
            .await?;
        if response.status != 201 {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to create test case: {}",
                    http_error_message(&response)
                ),
            ));
        }

        let key = response
            .body
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let summary = json!({
            "key": key,
            "script_type": script_type,
        });
        Ok(format!(
            "Test case created successfully: {key}\n{}",
            to_pretty_json(&summary)
        ))
    }

    async fn tool_update_test_case_bdd(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let key = required_string(args, "test_case_key")?;
        let bdd_content = required_string(args, "bdd_content")?;
        let path = format!("{}/{key}", self.endpoints.testcase);

        let get_response = self.send_api_request(Method::GET, &path, &[], None).await?;
        if get_response.status == 404 {
            return Err(ToolError::new(
                "not_found",
                format!("Test case {key} not found"),
            ));
        }
        if !get_response.is_success() {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to read test case {key} for update: {}",
                    http_error_message(&get_response)
                ),
            ));
        }

        let payload = build_update_payload(&get_response.body, &bdd_content)?;
        let text_length = payload
            .pointer("/testScript/text")
            .and_then(Value::as_str)
            .map(str::len)
            .unwrap_or(0);
        let preserved_labels = payload
            .get("labels")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        let update_response = self
            .send_api_request(Method::PUT, &path, &[], Some(payload))
            .await?;
        if update_response.status != 200 {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to update test case BDD: {}",
                    http_error_message(&update_response)
                ),
            ));
        }

        let summary = json!({
            "text_length": text_length,
            "preserved_labels": preserved_labels,
        });
        Ok(format!(
            "Updated {key} with BDD content successfully\n{}",
            to_pretty_json(&summary)
        ))
    }

    async fn tool_delete_test_case(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let key = required_string(args, "test_case_key")?;
        let path = format!("{}/{key}", self.endpoints.testcase);

        let response = self
            .send_api_request(Method::DELETE, &path, &[], None)
            .await?;
        if response.status != 204 {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to delete test case: {}",
                    http_error_message(&response)
                ),
            ));
        }
        Ok(format!("Test case {key} deleted successfully."))
    }

    async fn tool_create_folder(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let project_key = required_string(args, "project_key")?;
        let name = required_string(args, "name")?;
        let folder_type = arg_string(args, "folder_type", DEFAULT_FOLDER_TYPE)?;
        if !FOLDER_TYPES.contains(&folder_type.as_str()) {
            return Err(ToolError::new(
                "validation_failed",
                format!("'folder_type' must be one of {}", FOLDER_TYPES.join(", ")),
            )
            .with_field("folder_type"));
        }

        // `name` is the full folder path including parents, e.g. "/Parent/Child".
        let payload = json!({
            "projectKey": project_key,
            "name": name,
            "type": folder_type,
        });
        let response = self
            .send_api_request(Method::POST, self.endpoints.folder, &[], Some(payload))
            .await?;
        if !matches!(response.status, 200 | 201) {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to create folder: {}",
                    http_error_message(&response)
                ),
            ));
        }

        let created_name = response
            .body
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&name);
        let folder_id = response
            .body
            .get("id")
            .map(compact_json)
            .unwrap_or_else(|| "N/A".to_string());
        Ok(format!(
            "Folder created successfully: {created_name} (ID: {folder_id})\n{}",
            to_pretty_json(&response.body)
        ))
    }

    async fn tool_create_test_run(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let project_key = required_string(args, "project_key")?;
        let name = required_string(args, "name")?;
        let test_case_keys = arg_optional_string_array(args, "test_case_keys")?;

        let mut payload = Map::new();
        payload.insert("projectKey".to_string(), json!(project_key));
        payload.insert("name".to_string(), json!(name));
        if let Some(keys) = test_case_keys
            .as_deref()
            .filter(|keys| !keys.is_empty())
        {
            let items: Vec<Value> = keys
                .iter()
                .map(|key| json!({ "testCaseKey": key }))
                .collect();
            payload.insert("items".to_string(), json!(items));
        }
        if let Some(folder) = arg_optional_string(args, "folder")? {
            payload.insert("folder".to_string(), json!(folder));
        }
        if let Some(date) = arg_optional_string(args, "planned_start_date")? {
            validate_rfc3339(&date, "planned_start_date")?;
            payload.insert("plannedStartDate".to_string(), json!(date));
        }
        if let Some(date) = arg_optional_string(args, "planned_end_date")? {
            validate_rfc3339(&date, "planned_end_date")?;
            payload.insert("plannedEndDate".to_string(), json!(date));
        }
        if let Some(description) = arg_optional_string(args, "description")? {
            payload.insert("description".to_string(), json!(description));
        }
        if let Some(owner) = arg_optional_string(args, "owner")? {
            payload.insert("owner".to_string(), json!(owner));
        }
        if let Some(environment) = arg_optional_string(args, "environment")? {
            payload.insert("environment".to_string(), json!(environment));
        }
        if let Some(custom_fields) = arg_optional_object(args, "custom_fields")? {
            payload.insert("customFields".to_string(), custom_fields);
        }
        if let Some(test_plan_key) = arg_optional_string(args, "test_plan_key")? {
            payload.insert("testPlanKey".to_string(), json!(test_plan_key));
        }

        let environment = payload
            .get("environment")
            .and_then(Value::as_str)
            .unwrap_or("Not specified")
            .to_string();
        let test_case_count = test_case_keys.map(|keys| keys.len()).unwrap_or(0);

        let response = self
            .send_api_request(
                Method::POST,
                self.endpoints.testrun,
                &[],
                Some(Value::Object(payload)),
            )
            .await?;
        if response.status != 201 {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to create test run: {}",
                    http_error_message(&response)
                ),
            ));
        }

        let run_key = response
            .body
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let summary = json!({
            "key": run_key,
            "name": name,
            "test_case_count": test_case_count,
            "environment": environment,
        });
        Ok(format!(
            "Test run created successfully: {run_key}\n{}",
            to_pretty_json(&summary)
        ))
    }

    async fn tool_get_test_run(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let run_key = required_string(args, "test_run_key")?;
        let path = format!("{}/{run_key}", self.endpoints.testrun);

        let response = self.send_api_request(Method::GET, &path, &[], None).await?;
        if response.status == 404 {
            return Err(ToolError::new(
                "not_found",
                format!("Test run {run_key} not found"),
            ));
        }
        if !response.is_success() {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to get test run: {}",
                    http_error_message(&response)
                ),
            ));
        }
        Ok(to_pretty_json(&response.body))
    }

    async fn tool_get_test_run_cases(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let run_key = required_string(args, "test_run_key")?;
        let path = format!("{}/{run_key}", self.endpoints.testrun);

        let response = self.send_api_request(Method::GET, &path, &[], None).await?;
        if response.status == 404 {
            return Err(ToolError::new(
                "not_found",
                format!("Test run {run_key} not found"),
            ));
        }
        if !response.is_success() {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to get test run cases: {}",
                    http_error_message(&response)
                ),
            ));
        }

        let test_cases: Vec<&str> = response
            .body
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("testCaseKey").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        Ok(to_pretty_json(&json!(test_cases)))
    }

    /// Sequential per-run search: one GET per candidate run, stopping at the
    /// first run that contains the execution id. Per-run failures are
    /// accumulated as diagnostics and never abort the remaining candidates.
    async fn tool_get_test_execution(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let execution_id = required_string(args, "execution_id")?;
        let run_keys = required_string_array(args, "test_run_keys").map_err(|err| {
            err.with_docs_hint(
                "Provide an array of test run keys to search in (e.g. [\"PROJ-C152\", \"PROJ-C161\"]). Use zephyr_get_test_run_cases to find test runs if needed.",
            )
        })?;

        let mut search_results: Vec<Value> = Vec::new();
        for run_key in &run_keys {
            let path = format!("{}/{run_key}/testresults", self.endpoints.testrun);
            match self.send_api_request(Method::GET, &path, &[], None).await {
                Ok(response) if response.is_success() => {
                    let results: Vec<Value> = match &response.body {
                        Value::Array(items) => items.clone(),
                        Value::Null => Vec::new(),
                        other => vec![other.clone()],
                    };
                    if let Some(found) = find_execution(&results, &execution_id) {
                        return Ok(format!(
                            "Test execution {execution_id} found in {run_key}:\n{}",
                            to_pretty_json(found)
                        ));
                    }
                    let execution_ids: Vec<Value> = results
                        .iter()
                        .filter_map(|result| result.get("id").cloned())
                        .take(SEARCH_DIAGNOSTIC_ID_LIMIT)
                        .collect();
                    search_results.push(json!({
                        "test_run_key": run_key,
                        "execution_count": results.len(),
                        "execution_ids": execution_ids,
                    }));
                }
                Ok(response) => {
                    search_results.push(json!({
                        "test_run_key": run_key,
                        "error": http_error_message(&response),
                    }));
                }
                Err(err) => {
                    search_results.push(json!({
                        "test_run_key": run_key,
                        "error": err.message,
                    }));
                }
            }
        }

        Err(ToolError::new(
            "execution_not_found",
            format!(
                "Test execution {execution_id} not found in any of the {} test runs searched. Search results: {}",
                run_keys.len(),
                to_pretty_json(&json!(search_results))
            ),
        )
        .with_details(json!({ "search_results": search_results })))
    }

    async fn tool_search_test_cases_by_folder(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let project_key = required_string(args, "project_key")?;
        let folder_path = required_string(args, "folder_path")?;
        let max_results =
            arg_optional_u64(args, "max_results")?.unwrap_or(DEFAULT_SEARCH_MAX_RESULTS);

        let query_text = folder_search_query(&project_key, &folder_path);
        let query = vec![
            ("query".to_string(), query_text.clone()),
            ("maxResults".to_string(), max_results.to_string()),
        ];

        let response = self
            .send_api_request(Method::GET, self.endpoints.search, &query, None)
            .await?;
        if response.status == 404 {
            return Err(ToolError::new(
                "not_found",
                format!("Folder \"{folder_path}\" not found or no test cases found"),
            ));
        }
        if !response.is_success() {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to search test cases by folder: {}",
                    http_error_message(&response)
                ),
            ));
        }

        let test_cases = unwrap_search_results(&response.body);
        let test_case_keys: Vec<&str> = test_cases
            .iter()
            .filter_map(|case| case.get("key").and_then(Value::as_str))
            .collect();
        let summary = json!({
            "folder": folder_path,
            "query": query_text,
            "test_case_keys": test_case_keys,
            "total_count": test_cases.len(),
        });
        Ok(format!(
            "Found {} test cases in folder \"{folder_path}\":\n{}",
            test_cases.len(),
            to_pretty_json(&summary)
        ))
    }

    /// Membership reconciliation (strategy fixed by deployment variant):
    /// datacenter reads the run and resends the full item list with the
    /// missing keys appended; cloud sends the desired list directly.
    async fn tool_add_test_cases_to_run(
        &self,
        args: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let run_key = required_string(args, "test_run_key")?;
        let desired = required_string_array(args, "test_case_keys")?;
        let path = format!("{}/{run_key}", self.endpoints.testrun);

        if !self.config.deployment.requires_read_before_write() {
            let response = self
                .send_api_request(
                    Method::PUT,
                    &path,
                    &[],
                    Some(cloud_membership_payload(&desired)),
                )
                .await?;
            if !matches!(response.status, 200 | 204) {
                return Err(ToolError::new(
                    "upstream_error",
                    format!(
                        "Failed to add test cases: {}",
                        http_error_message(&response)
                    ),
                ));
            }
            return Ok(format!(
                "Successfully updated test cases for test run {run_key}."
            ));
        }

        let get_response = self.send_api_request(Method::GET, &path, &[], None).await?;
        if get_response.status == 404 {
            return Err(ToolError::new(
                "not_found",
                format!("Test run {run_key} not found"),
            ));
        }
        if !get_response.is_success() {
            return Err(ToolError::new(
                "upstream_error",
                format!(
                    "Failed to read test run {run_key}: {}",
                    http_error_message(&get_response)
                ),
            ));
        }

        let existing = get_response
            .body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        match merge_run_items(&existing, &desired) {
            MembershipUpdate::NoChange => {
                Ok("All specified test cases are already in the test run.".to_string())
            }
            MembershipUpdate::FullReplace { items, added } => {
                let response = self
                    .send_api_request(Method::PUT, &path, &[], Some(json!({ "items": items })))
                    .await?;
                if !matches!(response.status, 200 | 201 | 204) {
                    return Err(ToolError::new(
                        "upstream_error",
                        format!(
                            "Failed to add test cases: {}",
                            http_error_message(&response)
                        ),
                    ));
                }
                Ok(format!(
                    "Added {added} new test cases to test run {run_key}."
                ))
            }
        }
    }

    async fn send_api_request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<ApiCallResult, ToolError> {
        let mut url = reqwest::Url::parse(&format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            path
        ))
        .map_err(|e| ToolError::new("invalid_url", format!("Invalid API URL/path: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let mut request = self.http.request(method, url);
        if !self.config.no_auth {
            let token = self.resolve_bearer_token()?;
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            ToolError::new(
                "connection_error",
                format!(
                    "Failed to reach Zephyr Scale API at {}: {e}",
                    self.config.base_url
                ),
            )
            .with_docs_hint("Ensure the platform is reachable and ZEPHYR_BASE_URL points to it.")
        })?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            ToolError::new(
                "response_error",
                format!("Failed to read API response body: {e}"),
            )
        })?;
        let body = parse_response_body(&bytes);

        Ok(ApiCallResult { status, body })
    }

    fn resolve_bearer_token(&self) -> Result<String, ToolError> {
        if let Some(token) = &self.config.explicit_token {
            return Ok(token.clone());
        }
        resolve_token().map_err(|e| {
            ToolError::new("auth_missing", e.to_string())
                .with_docs_hint("Set ZEPHYR_API_TOKEN, pass --token, or use --no-auth behind an auth proxy.")
        })
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

#[derive(Debug)]
struct ApiCallResult {
    status: u16,
    body: Value,
}

impl ApiCallResult {
    fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "zephyr_get_test_case",
            description: "Get detailed information about a specific test case.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "test_case_key": { "type": "string", "description": "Test case key (e.g. PROJ-T123)" }
                },
                "required": ["test_case_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_create_test_case",
            description: "Create a new test case with STEP_BY_STEP, PLAIN_TEXT, or BDD content. New test cases always enter Draft status.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project_key": { "type": "string", "description": "Project key" },
                    "name": { "type": "string", "description": "Test case name" },
                    "test_script": {
                        "type": "object",
                        "description": "Test script: type plus steps (STEP_BY_STEP) or text (PLAIN_TEXT/BDD). BDD text may be Given/When/Then markdown; it is normalized before sending.",
                        "properties": {
                            "type": { "type": "string", "enum": ["STEP_BY_STEP", "PLAIN_TEXT", "BDD"] },
                            "steps": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "description": { "type": "string" },
                                        "testData": { "type": "string" },
                                        "expectedResult": { "type": "string" },
                                        "testCaseKey": { "type": "string", "description": "Reference to another test case" }
                                    },
                                    "additionalProperties": false
                                }
                            },
                            "text": { "type": "string" }
                        },
                        "required": ["type"]
                    },
                    "folder": { "type": "string", "description": "Folder path (e.g. \"/Orbiter/Cargo Bay\")" },
                    "status": { "type": "string", "enum": ["Draft", "Approved", "Deprecated"], "description": "Ignored on create; new test cases are always Draft" },
                    "priority": { "type": "string", "enum": ["High", "Normal", "Low"] },
                    "precondition": { "type": "string" },
                    "objective": { "type": "string" },
                    "component": { "type": "string" },
                    "owner": { "type": "string" },
                    "estimated_time": { "type": "number", "description": "Estimated time in milliseconds" },
                    "labels": { "type": "array", "items": { "type": "string" } },
                    "issue_links": { "type": "array", "items": { "type": "string" } },
                    "custom_fields": { "type": "object", "additionalProperties": true },
                    "parameters": { "type": "object", "description": "Test parameters for data-driven testing" }
                },
                "required": ["project_key", "name"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_update_test_case_bdd",
            description: "Update an existing test case with BDD content. Reads the current record, preserves its fields, and rewrites the test script.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "test_case_key": { "type": "string", "description": "Test case key to update" },
                    "bdd_content": { "type": "string", "description": "BDD content in markdown format" }
                },
                "required": ["test_case_key", "bdd_content"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_delete_test_case",
            description: "Delete a specific test case.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "test_case_key": { "type": "string", "description": "Test case key to delete (e.g. PROJ-T123)" }
                },
                "required": ["test_case_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_create_folder",
            description: "Create a folder for test cases, test plans, or test runs.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project_key": { "type": "string" },
                    "name": { "type": "string", "description": "Full folder path including parents (e.g. \"/Parent/Child\")" },
                    "folder_type": { "type": "string", "enum": ["TEST_CASE", "TEST_PLAN", "TEST_RUN"], "default": "TEST_CASE" }
                },
                "required": ["project_key", "name"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_create_test_run",
            description: "Create a new test run, optionally seeded with test cases.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project_key": { "type": "string" },
                    "name": { "type": "string" },
                    "test_case_keys": { "type": "array", "items": { "type": "string" } },
                    "test_plan_key": { "type": "string" },
                    "folder": { "type": "string" },
                    "planned_start_date": { "type": "string", "description": "RFC 3339 date-time" },
                    "planned_end_date": { "type": "string", "description": "RFC 3339 date-time" },
                    "description": { "type": "string" },
                    "owner": { "type": "string" },
                    "environment": { "type": "string" },
                    "custom_fields": { "type": "object", "additionalProperties": true }
                },
                "required": ["project_key", "name"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_get_test_run",
            description: "Get detailed information about a specific test run.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "test_run_key": { "type": "string", "description": "Test run key (e.g. PROJ-R123)" }
                },
                "required": ["test_run_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_get_test_run_cases",
            description: "Get the test case keys contained in a test run.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "test_run_key": { "type": "string", "description": "Test run key (e.g. PROJ-C123)" }
                },
                "required": ["test_run_key"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_get_test_execution",
            description: "Find a test execution by id across the given test runs. Runs are searched in order; the first match wins.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "execution_id": { "type": "string", "description": "Test execution id (e.g. 5805255)" },
                    "test_run_keys": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 1,
                        "description": "Test run keys to search in (e.g. [\"PROJ-C152\", \"PROJ-C161\"])"
                    }
                },
                "required": ["execution_id", "test_run_keys"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_search_test_cases_by_folder",
            description: "Search for test cases in a specific folder.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project_key": { "type": "string" },
                    "folder_path": { "type": "string", "description": "Folder path to search in (e.g. /ProjectName/SubFolder)" },
                    "max_results": { "type": "number", "default": 100 }
                },
                "required": ["project_key", "folder_path"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "zephyr_add_test_cases_to_run",
            description: "Add test cases to an existing test run. Idempotent: keys already in the run are skipped and existing members are preserved.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "test_run_key": { "type": "string", "description": "Test run key (e.g. PROJ-C161)" },
                    "test_case_keys": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
                },
                "required": ["test_run_key", "test_case_keys"],
                "additionalProperties": false
            }),
        },
    ]
}

fn http_error_message(result: &ApiCallResult) -> String {
    format!("Status: {}, Data: {}", result.status, compact_json(&result.body))
}

/// Builds the search query, escaping double quotes in the folder path.
fn folder_search_query(project_key: &str, folder_path: &str) -> String {
    let escaped_folder_path = folder_path.replace('"', "\\\"");
    format!("projectKey = \"{project_key}\" AND folder = \"{escaped_folder_path}\"")
}

/// Unwraps the search endpoint's three known response shapes, in priority
/// order: bare array, then `{"values": [...]}`, then `{"results": [...]}`.
/// Anything else is treated as an empty result set.
fn unwrap_search_results(body: &Value) -> Vec<Value> {
    if let Some(items) = body.as_array() {
        return items.clone();
    }
    for key in ["values", "results"] {
        if let Some(items) = body.get(key).and_then(Value::as_array) {
            return items.clone();
        }
    }
    Vec::new()
}

/// Linear scan for a result whose `id` renders to the requested execution
/// id. Ids arrive as numbers on datacenter and strings on cloud.
fn find_execution<'a>(results: &'a [Value], execution_id: &str) -> Option<&'a Value> {
    results.iter().find(|result| match result.get("id") {
        Some(Value::Number(id)) => id.to_string() == execution_id,
        Some(Value::String(id)) => id == execution_id,
        _ => false,
    })
}

fn validate_rfc3339(raw: &str, field: &str) -> Result<(), ToolError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|_| ())
        .map_err(|_| {
            ToolError::new(
                "validation_failed",
                format!("'{field}' must be an RFC 3339 date-time"),
            )
            .with_field(field)
        })
}

fn arg_string(args: &Map<String, Value>, key: &str, default: &str) -> Result<String, ToolError> {
    match args.get(key) {
        None => Ok(default.to_string()),
        Some(Value::String(v)) => Ok(v.clone()),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("'{key}' must be an unsigned integer"),
                )
                .with_field(key)
            })
            .map(Some),
        Some(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must be an unsigned integer"),
        )
        .with_field(key)),
    }
}

fn arg_optional_string_array(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let items = value.as_array().ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("'{key}' must be an array of strings"),
        )
        .with_field(key)
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let text = item.as_str().ok_or_else(|| {
            ToolError::new(
                "validation_failed",
                format!("'{key}' items must be strings"),
            )
            .with_field(key)
        })?;
        let normalized = text.trim();
        if !normalized.is_empty() {
            out.push(normalized.to_string());
        }
    }
    Ok(Some(out))
}

fn required_string_array(args: &Map<String, Value>, key: &str) -> Result<Vec<String>, ToolError> {
    match arg_optional_string_array(args, key)? {
        Some(items) if !items.is_empty() => Ok(items),
        _ => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' is required and must contain at least one entry"),
        )
        .with_field(key)),
    }
}

fn arg_optional_object(args: &Map<String, Value>, key: &str) -> Result<Option<Value>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value.clone())),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be an object"))
                .with_field(key),
        ),
    }
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
