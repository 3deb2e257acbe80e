//! End-to-end tests of the `relbridge` binary against a temporary SQLite database

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Workspace {
        dir: TempDir,
        config: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = dir.path().join("cli.db");
            let config = dir.path().join("relbridge.toml");
            fs::write(
                &config,
                format!(
                    "[database]\nconnection_string = {:?}\ndialect = \"sqlite\"\n",
                    db.display().to_string()
                ),
            )
            .unwrap();
            Workspace { dir, config }
        }

        fn run(&self, args: &[&str]) -> assert_cmd::assert::Assert {
            Command::cargo_bin("relbridge")
                .unwrap()
                .arg(&self.config)
                .args(args)
                .env_remove("RUST_LOG")
                .assert()
        }

        fn stdout(&self, args: &[&str]) -> serde_json::Value {
            let output = self.run(args).success().get_output().stdout.clone();
            serde_json::from_slice(&output).unwrap()
        }
    }

    fn seeded() -> Workspace {
        let ws = Workspace::new();
        ws.run(&["exec", "create table notes(Id integer primary key, Body text, Stars integer)"])
            .success();
        for (body, stars) in [("alpha", 3), ("beta", 5)] {
            let params = format!(r#"{{"Body": "{}", "Stars": {}}}"#, body, stars);
            ws.run(&["exec", "insert into notes(Body, Stars) values(@Body, @Stars)", &params])
                .success();
        }
        ws
    }

    #[test]
    fn test_exec_reports_rows_affected() {
        let ws = seeded();
        let out = ws.stdout(&["exec", "update notes set Stars = Stars + 1"]);
        assert_eq!(out, serde_json::json!({"rows_affected": 2}));
    }

    #[test]
    fn test_query_prints_rows_in_column_order() {
        let ws = seeded();
        ws.run(&["query", "select Body, Stars from notes where Stars > @Min order by Id", r#"{"Min": 4}"#])
            .success()
            .stdout("[{\"Body\":\"beta\",\"Stars\":5}]\n");
    }

    #[test]
    fn test_scalar_prints_first_value() {
        let ws = seeded();
        let out = ws.stdout(&["scalar", "select sum(Stars) from notes"]);
        assert_eq!(out, serde_json::json!(8));
    }

    #[test]
    fn test_tx_file_chains_outputs() {
        let ws = seeded();
        let steps = ws.dir.path().join("steps.json");
        fs::write(
            &steps,
            r#"[
                {"command_text": "insert into notes(Body, Stars) values('gamma', 1)"},
                {"command_text": "select max(Id) from notes", "result_kind": "scalar", "output": "LastId"},
                {"command_text": "select Body from notes where Id = @LastId", "result_kind": "entity_list", "inputs": ["LastId"]}
            ]"#,
        )
        .unwrap();

        let out = ws.stdout(&["tx", steps.to_str().unwrap()]);
        assert_eq!(out, serde_json::json!({"rows": [{"Body": "gamma"}]}));
    }

    #[test]
    fn test_failed_tx_rolls_back() {
        let ws = seeded();
        let steps = ws.dir.path().join("steps.json");
        fs::write(
            &steps,
            r#"[
                {"command_text": "delete from notes"},
                {"command_text": "select * from missing_table", "result_kind": "entity_list"}
            ]"#,
        )
        .unwrap();

        ws.run(&["tx", steps.to_str().unwrap()]).failure().code(1);
        let out = ws.stdout(&["scalar", "select count(*) from notes"]);
        assert_eq!(out, serde_json::json!(2));
    }

    #[test]
    fn test_help_and_bad_arguments() {
        Command::cargo_bin("relbridge")
            .unwrap()
            .arg("--help")
            .assert()
            .success();

        let ws = Workspace::new();
        ws.run(&["drop", "notes"]).failure().code(2);
    }

    #[test]
    fn test_missing_config_fails() {
        Command::cargo_bin("relbridge")
            .unwrap()
            .args(["/nonexistent/relbridge.toml", "scalar", "select 1"])
            .assert()
            .failure()
            .code(1);
    }
}
