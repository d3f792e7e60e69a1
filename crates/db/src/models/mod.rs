pub mod site_config;
pub mod skill;
pub mod workflow_job;
pub mod workflow_run;
pub mod workflow_template;

#[cfg(test)]
pub(crate) mod test_utils;
