mod cli_tests;
mod health_tests;
mod orchestration_tests;
mod uploader_tests;
